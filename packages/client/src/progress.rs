use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// Opaque caller value echoed back on every event of an operation.
#[derive(Clone, Default)]
pub struct UserToken(Option<Arc<dyn Any + Send + Sync>>);

impl UserToken {
    pub fn none() -> Self {
        Self(None)
    }

    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self(Some(Arc::new(value)))
    }

    pub fn get<T: Any>(&self) -> Option<&T> {
        self.0.as_deref().and_then(|value| value.downcast_ref::<T>())
    }

    pub fn is_none(&self) -> bool {
        self.0.is_none()
    }
}

impl fmt::Debug for UserToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(_) => f.write_str("UserToken(..)"),
            None => f.write_str("UserToken(None)"),
        }
    }
}

/// Whole-number share of `done` in `total`, clamped to 100.
///
/// An unknown or zero total reports 0.
pub fn percentage(done: u64, total: Option<u64>) -> u8 {
    match total {
        Some(total) if total > 0 => {
            let share = u128::from(done) * 100 / u128::from(total);
            share.min(100) as u8
        }
        _ => 0,
    }
}

/// Intermediate progress of a running operation.
#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub units_done: u64,
    pub units_total: Option<u64>,
    pub percentage: u8,
    pub token: UserToken,
}

impl ProgressEvent {
    pub fn new(units_done: u64, units_total: Option<u64>, token: UserToken) -> Self {
        Self {
            units_done,
            units_total,
            percentage: percentage(units_done, units_total),
            token,
        }
    }
}
