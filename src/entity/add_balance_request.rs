use serde::{Deserialize, Serialize};

const MICRODOLLARS_PER_DOLLAR: f64 = 1_000_000.0;

/// Request to credit a user's balance, amount given in millionths of a dollar
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddBalanceRequest {
    pub user_id: i64,
    pub microdollars: i64,
}

impl AddBalanceRequest {
    pub fn new(user_id: i64, microdollars: i64) -> Self {
        Self {
            user_id,
            microdollars,
        }
    }

    /// Amount in dollars, derived on every call
    pub fn dollars(&self) -> f64 {
        self.microdollars as f64 / MICRODOLLARS_PER_DOLLAR
    }
}
