//! `attendance` table: one row per `(day, reg_no)`.
//!
//! The primary key arbitrates concurrent marks: the insert either creates
//! the row or does nothing, and the caller learns which from the change
//! count, all inside one IMMEDIATE transaction.

use std::collections::BTreeMap;

use roll_core::{AttendanceLedger, AttendanceRecord, Day, IdentityKey, MarkOutcome, Status};
use rusqlite::{OptionalExtension, TransactionBehavior, params};

use crate::error::{Result, StoreError};
use crate::store::{Store, parse_key};

fn parse_status(raw: &str) -> Result<Status> {
    Status::parse(raw).ok_or_else(|| StoreError::InvalidData(format!("unknown status {raw:?}")))
}

impl Store {
    fn mark_present(
        &self,
        day: &Day,
        identity: &IdentityKey,
        name: &str,
        timestamp: &str,
    ) -> Result<MarkOutcome> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let inserted = tx.execute(
            "INSERT INTO attendance (day, reg_no, status, name, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(day, reg_no) DO NOTHING",
            params![
                day.as_str(),
                identity.as_str(),
                Status::Present.as_str(),
                name,
                timestamp
            ],
        )?;

        let outcome = if inserted == 1 {
            MarkOutcome::Marked(AttendanceRecord::present(name, timestamp))
        } else {
            let (status, name, timestamp): (String, String, String) = tx.query_row(
                "SELECT status, name, timestamp FROM attendance WHERE day = ?1 AND reg_no = ?2",
                params![day.as_str(), identity.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )?;
            MarkOutcome::AlreadyMarked(AttendanceRecord {
                status: parse_status(&status)?,
                name,
                timestamp,
            })
        };

        tx.commit()?;
        Ok(outcome)
    }

    fn load_day(&self, day: &Day) -> Result<BTreeMap<IdentityKey, AttendanceRecord>> {
        let rows: Vec<(String, String, String, String)> = {
            let conn = self.conn()?;
            let mut stmt = conn.prepare(
                "SELECT reg_no, status, name, timestamp FROM attendance WHERE day = ?1 ORDER BY reg_no",
            )?;
            stmt.query_map([day.as_str()], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
            })?
            .collect::<std::result::Result<_, _>>()?
        };

        let mut out = BTreeMap::new();
        for (reg_no, status, name, timestamp) in rows {
            out.insert(
                parse_key(&reg_no)?,
                AttendanceRecord {
                    status: parse_status(&status)?,
                    name,
                    timestamp,
                },
            );
        }
        Ok(out)
    }

    fn delete_day(&self, day: &Day) -> Result<usize> {
        Ok(self
            .conn()?
            .execute("DELETE FROM attendance WHERE day = ?1", [day.as_str()])?)
    }

    fn list_days(&self) -> Result<Vec<Day>> {
        let rows: Vec<String> = {
            let conn = self.conn()?;
            let mut stmt = conn.prepare("SELECT DISTINCT day FROM attendance ORDER BY day")?;
            stmt.query_map([], |row| row.get(0))?
                .collect::<std::result::Result<_, _>>()?
        };
        rows.iter()
            .map(|d| {
                Day::parse(d).map_err(|e| StoreError::InvalidData(format!("stored day {d:?}: {e}")))
            })
            .collect()
    }

    /// Record for one key, if any.
    pub fn attendance_record(
        &self,
        day: &Day,
        identity: &IdentityKey,
    ) -> Result<Option<AttendanceRecord>> {
        let row: Option<(String, String, String)> = {
            let conn = self.conn()?;
            conn.query_row(
                "SELECT status, name, timestamp FROM attendance WHERE day = ?1 AND reg_no = ?2",
                params![day.as_str(), identity.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?
        };
        row.map(|(status, name, timestamp)| {
            Ok(AttendanceRecord {
                status: parse_status(&status)?,
                name,
                timestamp,
            })
        })
        .transpose()
    }
}

impl AttendanceLedger for Store {
    fn try_mark_present(
        &self,
        day: &Day,
        identity: &IdentityKey,
        name: &str,
        timestamp: &str,
    ) -> roll_core::Result<MarkOutcome> {
        Ok(self.mark_present(day, identity, name, timestamp)?)
    }

    fn get_day(&self, day: &Day) -> roll_core::Result<BTreeMap<IdentityKey, AttendanceRecord>> {
        Ok(self.load_day(day)?)
    }

    fn reset_day(&self, day: &Day) -> roll_core::Result<usize> {
        Ok(self.delete_day(day)?)
    }

    fn days(&self) -> roll_core::Result<Vec<Day>> {
        Ok(self.list_days()?)
    }
}
