use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::Result;

/// Typed wrapper over the `objects`, `blocks` and `inode_blocks` tables.
///
/// Follows the idiom of the pack's own local-metadata cache
/// (`rusqlite::Connection` behind a mutex, schema created with
/// `CREATE TABLE IF NOT EXISTS`, rows read back with `query_row` +
/// `.optional()`): a single connection is not `Sync`, and SQLite itself
/// serializes writers, so one mutex around one connection is sufficient.
pub struct Metadata {
    conn: Mutex<Connection>,
}

pub struct ObjectRow {
    pub refcount: i64,
    pub size: i64,
}

pub struct BlockLookup {
    pub block_id: i64,
    pub obj_id: i64,
}

impl Metadata {
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)?;
        let md = Metadata {
            conn: Mutex::new(conn),
        };
        md.create_schema()?;
        Ok(md)
    }

    pub fn in_memory() -> Result<Self> {
        Self::open(":memory:")
    }

    /// Creates the three tables this crate depends on if they don't
    /// already exist. A production mount instead hands the cache a
    /// connection into the already-initialized S3QL catalog; this makes
    /// the crate runnable standalone for tests and examples.
    fn create_schema(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS objects (
                 id       INTEGER PRIMARY KEY,
                 refcount INTEGER NOT NULL,
                 size     INTEGER NOT NULL
             );
             CREATE TABLE IF NOT EXISTS blocks (
                 id       INTEGER PRIMARY KEY,
                 refcount INTEGER NOT NULL,
                 obj_id   INTEGER NOT NULL REFERENCES objects(id),
                 hash     BLOB,
                 size     INTEGER NOT NULL
             );
             CREATE INDEX IF NOT EXISTS ix_blocks_hash ON blocks(hash);
             CREATE TABLE IF NOT EXISTS inode_blocks (
                 inode    INTEGER NOT NULL,
                 blockno  INTEGER NOT NULL,
                 block_id INTEGER NOT NULL REFERENCES blocks(id),
                 PRIMARY KEY (inode, blockno)
             );",
        )?;
        Ok(())
    }

    pub fn block_id_for_position(&self, inode: u64, blockno: u64) -> Result<Option<i64>> {
        let conn = self.conn.lock();
        let id = conn
            .query_row(
                "SELECT block_id FROM inode_blocks WHERE inode=?1 AND blockno=?2",
                params![inode as i64, blockno as i64],
                |row| row.get(0),
            )
            .optional()?;
        Ok(id)
    }

    pub fn block_by_hash(&self, hash: &[u8]) -> Result<Option<i64>> {
        let conn = self.conn.lock();
        let id = conn
            .query_row(
                "SELECT id FROM blocks WHERE hash=?1",
                params![hash],
                |row| row.get(0),
            )
            .optional()?;
        Ok(id)
    }

    pub fn block_lookup(&self, block_id: i64) -> Result<Option<BlockLookup>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT id, obj_id FROM blocks WHERE id=?1",
                params![block_id],
                |row| {
                    Ok(BlockLookup {
                        block_id: row.get(0)?,
                        obj_id: row.get(1)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    pub fn block_refcount(&self, block_id: i64) -> Result<Option<i64>> {
        let conn = self.conn.lock();
        let rc = conn
            .query_row(
                "SELECT refcount FROM blocks WHERE id=?1",
                params![block_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(rc)
    }

    pub fn object_row(&self, obj_id: i64) -> Result<Option<ObjectRow>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT refcount, size FROM objects WHERE id=?1",
                params![obj_id],
                |row| {
                    Ok(ObjectRow {
                        refcount: row.get(0)?,
                        size: row.get(1)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    /// Inserts a new placeholder object (`size = -1` until upload
    /// completes) and returns its id.
    pub fn insert_object(&self) -> Result<i64> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO objects(refcount, size) VALUES (1, -1)",
            [],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Inserts a new block row reserving a content hash for dedup, and
    /// returns its id.
    pub fn insert_block(&self, obj_id: i64, hash: &[u8], size: u64) -> Result<i64> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO blocks(refcount, obj_id, hash, size) VALUES (1, ?1, ?2, ?3)",
            params![obj_id, hash, size as i64],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn upsert_inode_block(&self, inode: u64, blockno: u64, block_id: i64) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO inode_blocks(inode, blockno, block_id) VALUES (?1, ?2, ?3)",
            params![inode as i64, blockno as i64, block_id],
        )?;
        Ok(())
    }

    pub fn delete_inode_block(&self, inode: u64, blockno: u64) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "DELETE FROM inode_blocks WHERE inode=?1 AND blockno=?2",
            params![inode as i64, blockno as i64],
        )?;
        Ok(())
    }

    pub fn incr_block_refcount(&self, block_id: i64) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE blocks SET refcount = refcount + 1 WHERE id=?1",
            params![block_id],
        )?;
        Ok(())
    }

    pub fn decr_block_refcount(&self, block_id: i64) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE blocks SET refcount = refcount - 1 WHERE id=?1",
            params![block_id],
        )?;
        Ok(())
    }

    pub fn delete_block(&self, block_id: i64) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM blocks WHERE id=?1", params![block_id])?;
        Ok(())
    }

    pub fn decr_object_refcount(&self, obj_id: i64) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE objects SET refcount = refcount - 1 WHERE id=?1",
            params![obj_id],
        )?;
        Ok(())
    }

    pub fn delete_object(&self, obj_id: i64) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM objects WHERE id=?1", params![obj_id])?;
        Ok(())
    }

    pub fn set_object_size(&self, obj_id: i64, size: u64) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE objects SET size=?1 WHERE id=?2",
            params![size as i64, obj_id],
        )?;
        Ok(())
    }

    /// Marks every block row pointing at a failed upload as unusable for
    /// future dedup lookups, without deleting the row (it may already be
    /// linked from `inode_blocks`).
    pub fn invalidate_blocks_for_object(&self, obj_id: i64) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE blocks SET hash=NULL WHERE obj_id=?1",
            params![obj_id],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_object_and_block_round_trip() {
        let md = Metadata::in_memory().unwrap();
        let obj_id = md.insert_object().unwrap();
        assert_eq!(md.object_row(obj_id).unwrap().unwrap().size, -1);

        let block_id = md.insert_block(obj_id, b"hash-bytes", 4096).unwrap();
        md.upsert_inode_block(1, 0, block_id).unwrap();
        assert_eq!(md.block_id_for_position(1, 0).unwrap(), Some(block_id));
        assert_eq!(md.block_by_hash(b"hash-bytes").unwrap(), Some(block_id));

        md.set_object_size(obj_id, 4096).unwrap();
        assert_eq!(md.object_row(obj_id).unwrap().unwrap().size, 4096);
    }

    #[test]
    fn invalidate_clears_hash_but_keeps_row() {
        let md = Metadata::in_memory().unwrap();
        let obj_id = md.insert_object().unwrap();
        let block_id = md.insert_block(obj_id, b"digest", 10).unwrap();
        md.invalidate_blocks_for_object(obj_id).unwrap();
        assert_eq!(md.block_by_hash(b"digest").unwrap(), None);
        assert!(md.block_lookup(block_id).unwrap().is_some());
    }
}
