//! Row decoding traits and implementations.

use crate::error::{Error, Result};
use crate::value::{FromValue, Value, decode};

/// Trait for decoding a scanned row into a Rust type.
pub trait FromRow: Sized {
    /// Decode a row from its column values, in select-list order.
    fn from_row(columns: Vec<Value>) -> Result<Self>;
}

impl FromRow for Vec<Value> {
    fn from_row(columns: Vec<Value>) -> Result<Self> {
        Ok(columns)
    }
}

// === Tuple implementations ===

macro_rules! impl_from_row_tuple {
    ($len:literal => $($t:ident),+) => {
        impl<$($t: FromValue),+> FromRow for ($($t,)+) {
            fn from_row(columns: Vec<Value>) -> Result<Self> {
                if columns.len() < $len {
                    return Err(Error::Decode(format!(
                        "not enough columns for tuple: expected {}, got {}",
                        $len,
                        columns.len()
                    )));
                }
                let mut iter = columns.into_iter();
                Ok(($(decode::<$t>(iter.next().unwrap_or(Value::Null))?,)+))
            }
        }
    };
}

impl_from_row_tuple!(1 => T1);
impl_from_row_tuple!(2 => T1, T2);
impl_from_row_tuple!(3 => T1, T2, T3);
impl_from_row_tuple!(4 => T1, T2, T3, T4);
impl_from_row_tuple!(5 => T1, T2, T3, T4, T5);
impl_from_row_tuple!(6 => T1, T2, T3, T4, T5, T6);
impl_from_row_tuple!(7 => T1, T2, T3, T4, T5, T6, T7);
impl_from_row_tuple!(8 => T1, T2, T3, T4, T5, T6, T7, T8);
impl_from_row_tuple!(9 => T1, T2, T3, T4, T5, T6, T7, T8, T9);
impl_from_row_tuple!(10 => T1, T2, T3, T4, T5, T6, T7, T8, T9, T10);
