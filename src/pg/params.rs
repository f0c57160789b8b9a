//! Parameter marshalling.
//!
//! Converts call-site values into the positional text slots the transport's
//! parameterized calls take. A missing value, or `PgValue::Null`, becomes a
//! true SQL NULL slot, which is distinct from every string including "".
//!
//! Named parameters are only meaningful to the query builder, which knows
//! the placeholder order; raw and prepared command paths reject them.

use bytes::Bytes;
use smallvec::SmallVec;

use super::types::PgValue;
use crate::error::{DriverError, Result};

/// One transport-ready parameter; `None` is SQL NULL.
pub type ParamSlot = Option<Bytes>;

pub const NAMED_RAW_UNSUPPORTED: &str =
    "Named parameters in raw queries are not supported in PostgreSQL";
pub const NAMED_PREPARED_UNSUPPORTED: &str =
    "Named parameters in prepared statements are not supported in PostgreSQL";

/// Parameters supplied with an operation.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Params {
    /// No parameters.
    #[default]
    None,
    /// Ordered values bound to `$1`, `$2`, ...
    Positional(Vec<Option<PgValue>>),
    /// Values keyed by placeholder name.
    Named(Vec<(String, Option<PgValue>)>),
}

impl Params {
    pub fn none() -> Self {
        Params::None
    }

    pub fn positional<I, V>(values: I) -> Self
    where
        I: IntoIterator<Item = Option<V>>,
        V: Into<PgValue>,
    {
        Params::Positional(values.into_iter().map(|v| v.map(Into::into)).collect())
    }

    pub fn named<I, K, V>(values: I) -> Self
    where
        I: IntoIterator<Item = (K, Option<V>)>,
        K: Into<String>,
        V: Into<PgValue>,
    {
        Params::Named(
            values
                .into_iter()
                .map(|(k, v)| (k.into(), v.map(Into::into)))
                .collect(),
        )
    }

    pub fn is_named(&self) -> bool {
        matches!(self, Params::Named(_))
    }

    /// The positional values, or `UnsupportedError(message)` for named ones.
    pub(crate) fn require_positional(&self, message: &str) -> Result<&[Option<PgValue>]> {
        match self {
            Params::None => Ok(&[]),
            Params::Positional(values) => Ok(values),
            Params::Named(_) => Err(DriverError::UnsupportedError(message.to_string())),
        }
    }
}

impl From<Vec<PgValue>> for Params {
    fn from(values: Vec<PgValue>) -> Self {
        Params::Positional(values.into_iter().map(Some).collect())
    }
}

impl From<Vec<Option<PgValue>>> for Params {
    fn from(values: Vec<Option<PgValue>>) -> Self {
        Params::Positional(values)
    }
}

/// The marshalled parameter buffers of one transport call.
///
/// The buffers are owned by the operation that sends them and are released
/// when this value is dropped, after the consuming transport call returned,
/// whether that call succeeded or not.
#[derive(Debug, Default)]
pub struct ParamBuffers {
    slots: SmallVec<[ParamSlot; 8]>,
}

impl ParamBuffers {
    pub fn marshal(values: &[Option<PgValue>]) -> Self {
        let slots = values
            .iter()
            .map(|value| {
                value
                    .as_ref()
                    .and_then(PgValue::to_text)
                    .map(Bytes::from)
            })
            .collect();
        Self { slots }
    }

    #[inline]
    pub fn slots(&self) -> &[ParamSlot] {
        &self.slots
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}
