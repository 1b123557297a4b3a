//! Raw row fixtures shared by the unit tests

use rusqlite::{params, Connection};

use super::schema::EPOCH_TABLE;

/// Balance a validator holds at the start of `epoch` in the fixtures
pub fn balance_at(epoch: u64, validator_index: u64) -> i64 {
    32_000_000_000 + (epoch * 10 + validator_index) as i64
}

#[derive(Debug, Clone)]
pub struct EpochRow {
    pub epoch: u64,
    pub validator_index: u64,
    pub attestations_reward: i64,
    pub blocks_proposed: i64,
    pub slashed: bool,
    pub slashed_by: Option<u64>,
}

impl EpochRow {
    pub fn new(epoch: u64, validator_index: u64, attestations_reward: i64) -> Self {
        Self {
            epoch,
            validator_index,
            attestations_reward,
            blocks_proposed: 0,
            slashed: false,
            slashed_by: None,
        }
    }

    pub fn insert(&self, conn: &Connection) {
        let sql = format!(
            "INSERT INTO {} (epoch, validator_index, attestations_reward, blocks_proposed,
                slashed, slashed_by, balance_start, balance_end)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            EPOCH_TABLE
        );
        conn.execute(
            &sql,
            params![
                self.epoch,
                self.validator_index,
                self.attestations_reward,
                self.blocks_proposed,
                self.slashed,
                self.slashed_by,
                balance_at(self.epoch, self.validator_index),
                balance_at(self.epoch + 1, self.validator_index),
            ],
        )
        .unwrap();
    }
}

pub fn insert_epoch(conn: &Connection, epoch: u64, validator_index: u64, reward: i64) {
    EpochRow::new(epoch, validator_index, reward).insert(conn);
}

/// Rows for every epoch in `[from, to)` and every validator in `validators`
pub fn insert_epochs(conn: &Connection, from: u64, to: u64, validators: &[u64], reward: i64) {
    for epoch in from..to {
        for &validator in validators {
            insert_epoch(conn, epoch, validator, reward);
        }
    }
}
