use crate::errors::UsageError;
use anyhow::Result;
use getset::Getters;
use rust_decimal::prelude::*;
use serde::{Deserialize, Serialize};

/// The usage counters carried by every record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Counter {
    Data,
    Voice,
    Sms,
    Cash,
    MonthlyPurchases,
}

impl Counter {
    pub const ALL: [Counter; 5] = [
        Counter::Data,
        Counter::Voice,
        Counter::Sms,
        Counter::Cash,
        Counter::MonthlyPurchases,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Counter::Data => "data",
            Counter::Voice => "voice",
            Counter::Sms => "sms",
            Counter::Cash => "cash",
            Counter::MonthlyPurchases => "monthly_purchases",
        }
    }
}

/// Record-type discriminant of a CDR row. The codes are fixed by the
/// upstream producer; 4 is not assigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordType {
    Data,
    Voice,
    Sms,
    Cash,
}

impl RecordType {
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(RecordType::Data),
            2 => Some(RecordType::Voice),
            3 => Some(RecordType::Sms),
            5 => Some(RecordType::Cash),
            _ => None,
        }
    }

    /// Parses a discriminant field. Anything that is not one of the known
    /// codes yields `None`.
    pub fn parse(field: &str) -> Option<Self> {
        field.trim().parse::<u8>().ok().and_then(Self::from_code)
    }

    pub fn counter(&self) -> Counter {
        match self {
            RecordType::Data => Counter::Data,
            RecordType::Voice => Counter::Voice,
            RecordType::Sms => Counter::Sms,
            RecordType::Cash => Counter::Cash,
        }
    }
}

/// Tie-break rule used when rounding fractional cash to whole units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CashRounding {
    /// 12.5 -> 13, -12.5 -> -13
    #[default]
    HalfAwayFromZero,
    /// 12.5 -> 12, 13.5 -> 14
    HalfEven,
}

impl CashRounding {
    /// Rounds to an integral unit; `None` when the result does not fit an i64.
    pub fn round(&self, amount: Decimal) -> Option<i64> {
        let strategy = match self {
            CashRounding::HalfAwayFromZero => RoundingStrategy::MidpointAwayFromZero,
            CashRounding::HalfEven => RoundingStrategy::MidpointNearestEven,
        };
        amount.round_dp_with_strategy(0, strategy).to_i64()
    }
}

/// Per-subscriber usage aggregate. The key never changes after creation;
/// counters only grow through [`UsageRecord::merge`] and [`UsageRecord::combine`].
#[derive(Debug, Clone, PartialEq, Eq, Getters)]
pub struct UsageRecord {
    #[getset(get = "pub")]
    key: String,
    #[getset(get = "pub")]
    data: i64,
    #[getset(get = "pub")]
    voice: i64,
    #[getset(get = "pub")]
    sms: i64,
    #[getset(get = "pub")]
    cash: i64,
    #[getset(get = "pub")]
    monthly_purchases: i64,
}

impl UsageRecord {
    pub fn new(key: impl Into<String>) -> Self {
        UsageRecord {
            key: key.into(),
            data: 0,
            voice: 0,
            sms: 0,
            cash: 0,
            monthly_purchases: 0,
        }
    }

    pub fn get(&self, counter: Counter) -> i64 {
        match counter {
            Counter::Data => self.data,
            Counter::Voice => self.voice,
            Counter::Sms => self.sms,
            Counter::Cash => self.cash,
            Counter::MonthlyPurchases => self.monthly_purchases,
        }
    }

    fn slot(&mut self, counter: Counter) -> &mut i64 {
        match counter {
            Counter::Data => &mut self.data,
            Counter::Voice => &mut self.voice,
            Counter::Sms => &mut self.sms,
            Counter::Cash => &mut self.cash,
            Counter::MonthlyPurchases => &mut self.monthly_purchases,
        }
    }

    /// Adds `amount` to one counter and returns the updated record. A first
    /// contribution is a merge into the zero baseline.
    ///
    /// # Returns
    /// The merged record, or `NumericOverflow` if the counter would wrap.
    pub fn merge(mut self, counter: Counter, amount: i64) -> Result<Self> {
        let updated = self
            .get(counter)
            .checked_add(amount)
            .ok_or_else(|| UsageError::NumericOverflow {
                key: self.key.clone(),
                counter: counter.name(),
            })?;
        *self.slot(counter) = updated;
        Ok(self)
    }

    /// Adds every counter of `other` into this record. Both records must
    /// share a key.
    pub fn combine(self, other: &UsageRecord) -> Result<Self> {
        debug_assert_eq!(self.key, other.key);
        Counter::ALL
            .iter()
            .try_fold(self, |record, counter| record.merge(*counter, other.get(*counter)))
    }

    pub fn is_zero_usage(&self) -> bool {
        Counter::ALL.iter().all(|counter| self.get(*counter) == 0)
    }
}
