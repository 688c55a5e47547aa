//! `faces` table: one embedding and captured image per identity.

use roll_core::{EmbeddingStore, Enrollment, IdentityKey, now_iso8601, validate_embedding};
use rusqlite::{OptionalExtension, Row, params};

use crate::error::{Result, StoreError};
use crate::store::{Store, parse_key};

/// Little-endian f32 blob.
pub fn encode_embedding(embedding: &[f32]) -> Vec<u8> {
    embedding.iter().flat_map(|v| v.to_le_bytes()).collect()
}

pub fn decode_embedding(blob: &[u8], dimension: usize) -> Result<Vec<f32>> {
    if blob.len() != dimension * 4 {
        return Err(StoreError::InvalidData(format!(
            "embedding blob is {} bytes, expected {} for dimension {dimension}",
            blob.len(),
            dimension * 4
        )));
    }
    Ok(blob
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

struct FaceRow {
    reg_no: String,
    dimension: i64,
    embedding: Vec<u8>,
    image: Vec<u8>,
    enrolled_at: String,
}

impl FaceRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            reg_no: row.get(0)?,
            dimension: row.get(1)?,
            embedding: row.get(2)?,
            image: row.get(3)?,
            enrolled_at: row.get(4)?,
        })
    }

    fn into_enrollment(self) -> Result<Enrollment> {
        let identity = parse_key(&self.reg_no)?;
        let dimension = usize::try_from(self.dimension)
            .map_err(|_| StoreError::InvalidData(format!("negative dimension for {identity}")))?;
        let embedding = decode_embedding(&self.embedding, dimension)?;
        Ok(Enrollment::new(identity, embedding, self.image, self.enrolled_at))
    }
}

const SELECT_FACES: &str = "SELECT reg_no, dimension, embedding, image, enrolled_at FROM faces";

impl Store {
    fn save_face(&self, identity: &IdentityKey, embedding: &[f32], image: &[u8]) -> Result<()> {
        // Single upsert: readers see the old row or the new row, never a mix.
        self.conn()?.execute(
            "INSERT INTO faces (reg_no, dimension, embedding, image, enrolled_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(reg_no) DO UPDATE SET
                dimension = excluded.dimension,
                embedding = excluded.embedding,
                image = excluded.image,
                enrolled_at = excluded.enrolled_at",
            params![
                identity.as_str(),
                embedding.len() as i64,
                encode_embedding(embedding),
                image,
                now_iso8601(),
            ],
        )?;
        Ok(())
    }

    fn delete_face(&self, identity: &IdentityKey) -> Result<bool> {
        let n = self
            .conn()?
            .execute("DELETE FROM faces WHERE reg_no = ?1", [identity.as_str()])?;
        Ok(n > 0)
    }

    fn delete_all_faces(&self) -> Result<usize> {
        Ok(self.conn()?.execute("DELETE FROM faces", [])?)
    }

    fn load_faces(&self) -> Result<Vec<Enrollment>> {
        let rows: Vec<FaceRow> = {
            let conn = self.conn()?;
            let mut stmt = conn.prepare(&format!("{SELECT_FACES} ORDER BY reg_no"))?;
            stmt.query_map([], FaceRow::from_row)?
                .collect::<std::result::Result<_, _>>()?
        };
        rows.into_iter().map(FaceRow::into_enrollment).collect()
    }

    fn load_face(&self, identity: &IdentityKey) -> Result<Option<Enrollment>> {
        let row = {
            let conn = self.conn()?;
            conn.query_row(
                &format!("{SELECT_FACES} WHERE reg_no = ?1"),
                [identity.as_str()],
                FaceRow::from_row,
            )
            .optional()?
        };
        row.map(FaceRow::into_enrollment).transpose()
    }

    fn count_faces(&self) -> Result<usize> {
        let n: i64 = self
            .conn()?
            .query_row("SELECT COUNT(*) FROM faces", [], |row| row.get(0))?;
        Ok(n as usize)
    }
}

impl EmbeddingStore for Store {
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn enroll(
        &self,
        identity: &IdentityKey,
        embedding: Vec<f32>,
        image: Vec<u8>,
    ) -> roll_core::Result<()> {
        validate_embedding(&embedding, self.dimension)?;
        self.save_face(identity, &embedding, &image)?;
        Ok(())
    }

    fn remove(&self, identity: &IdentityKey) -> roll_core::Result<bool> {
        Ok(self.delete_face(identity)?)
    }

    fn remove_all(&self) -> roll_core::Result<usize> {
        Ok(self.delete_all_faces()?)
    }

    fn scan_all(&self) -> roll_core::Result<Vec<Enrollment>> {
        Ok(self.load_faces()?)
    }

    fn get(&self, identity: &IdentityKey) -> roll_core::Result<Option<Enrollment>> {
        Ok(self.load_face(identity)?)
    }

    fn len(&self) -> roll_core::Result<usize> {
        Ok(self.count_faces()?)
    }
}
