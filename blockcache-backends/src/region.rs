use std::fmt;

/// AWS region, or a custom S3-compatible endpoint.
#[derive(Debug, Clone)]
pub enum Region {
    UsEast1,
    UsEast2,
    UsWest1,
    UsWest2,
    EuWest1,
    EuCentral1,
    Custom { name: String, endpoint: String },
}

impl Region {
    pub fn endpoint(&self) -> String {
        match self {
            Region::Custom { endpoint, .. } => endpoint.clone(),
            _ => format!("https://s3.{}.amazonaws.com", self),
        }
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Region::UsEast1 => write!(f, "us-east-1"),
            Region::UsEast2 => write!(f, "us-east-2"),
            Region::UsWest1 => write!(f, "us-west-1"),
            Region::UsWest2 => write!(f, "us-west-2"),
            Region::EuWest1 => write!(f, "eu-west-1"),
            Region::EuCentral1 => write!(f, "eu-central-1"),
            Region::Custom { name, .. } => write!(f, "{name}"),
        }
    }
}
