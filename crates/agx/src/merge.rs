//! 🧮 Merge: the tiny algebra that turns a stampede of records into one tidy row.
//!
//! 🎬 *[a thousand spans walk into a bar. the bartender says "you're all `A_100`?"]*
//! *[they nod. he pours one drink and writes `calls=1000` on the tab.]*
//!
//! Every metric kind is a plain struct declared with [`metric_row!`]. Each field carries
//! one of three merge operations:
//!
//! - 🔒 [`MergeOp::Identity`]: seeded by the first record, never overwritten.
//! - 🔄 [`MergeOp::Replace`]: newest arrival wins (process-local order only).
//! - ➕ [`MergeOp::Accumulate`]: summed. Commutative, associative, unbothered by order.
//!
//! Accumulate columns also pick a [`FlushPolicy`]: `reset_on_flush` (the in-memory value
//! is a delta buffer, zeroed every flush) or `running_total` (the in-memory value keeps
//! growing and a per-key baseline remembers what storage already has).
//!
//! The macro writes the per-field code, so there is no runtime reflection and no
//! "get attribute by index" business. Accumulating a `String` is a compile error,
//! which is the correct amount of error. 🦆

use std::fmt::Debug;

use serde::Serialize;
use serde::de::DeserializeOwned;

/// 🎯 How a column folds a newer value into an older one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MergeOp {
    Identity,
    Replace,
    Accumulate,
}

/// 🚿 What happens to an Accumulate column after its value reaches storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlushPolicy {
    /// The in-memory value is a delta buffer and goes back to zero.
    ResetOnFlush,
    /// The in-memory value keeps its running total; the baseline advances instead.
    RunningTotal,
}

/// 🏷️ The wire-level type of a column. Five flavors, no sprinkles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    Str,
    Int,
    Long,
    Double,
    Bytes,
}

/// 📐 One column of a metric schema: name, type, merge op, and (for Accumulate) flush policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnDescriptor {
    pub name: &'static str,
    pub kind: ValueKind,
    pub merge: MergeOp,
    /// `None` for Identity and Replace columns, which have nothing to reset.
    pub flush: Option<FlushPolicy>,
}

/// 📦 Anything that can live in a column.
pub trait ColumnValue: Clone {
    const KIND: ValueKind;
}

/// ➕ Column values that can be summed, un-summed and zeroed.
///
/// Integer sums wrap instead of panicking. A counter that overflows `i64` has bigger
/// problems than us.
pub trait Summable: ColumnValue {
    fn zero() -> Self;
    fn accumulate(&mut self, other: &Self);
    fn retract(&mut self, other: &Self);
}

impl ColumnValue for String {
    const KIND: ValueKind = ValueKind::Str;
}

impl ColumnValue for Vec<u8> {
    const KIND: ValueKind = ValueKind::Bytes;
}

impl ColumnValue for i32 {
    const KIND: ValueKind = ValueKind::Int;
}

impl ColumnValue for i64 {
    const KIND: ValueKind = ValueKind::Long;
}

impl ColumnValue for f64 {
    const KIND: ValueKind = ValueKind::Double;
}

impl Summable for i32 {
    fn zero() -> Self {
        0
    }
    fn accumulate(&mut self, other: &Self) {
        *self = self.wrapping_add(*other);
    }
    fn retract(&mut self, other: &Self) {
        *self = self.wrapping_sub(*other);
    }
}

impl Summable for i64 {
    fn zero() -> Self {
        0
    }
    fn accumulate(&mut self, other: &Self) {
        *self = self.wrapping_add(*other);
    }
    fn retract(&mut self, other: &Self) {
        *self = self.wrapping_sub(*other);
    }
}

impl Summable for f64 {
    fn zero() -> Self {
        0.0
    }
    fn accumulate(&mut self, other: &Self) {
        *self += *other;
    }
    fn retract(&mut self, other: &Self) {
        *self -= *other;
    }
}

/// 🧬 The merge contract a [`metric_row!`] struct gets for free.
///
/// # Contract 📜
/// - `combine`: fold a newer record into this accumulator row.
/// - `take_unflushed`: split off what storage has not seen yet and advance local state
///   (zero `reset_on_flush` columns, move the baseline of `running_total` columns).
/// - `restore_unflushed`: exact inverse of `take_unflushed`, used when a write fails.
///   Works even if more records were combined in between, because sums commute.
/// - `reconcile`: merge an unflushed portion with the row already in storage.
/// - `zeroed_baseline`: a copy with every Accumulate column at zero.
pub trait Mergeable: Sized {
    const COLUMNS: &'static [ColumnDescriptor];

    fn combine(&mut self, incoming: &Self);
    fn take_unflushed(&mut self, baseline: &mut Self) -> Self;
    fn restore_unflushed(&mut self, baseline: &mut Self, taken: &Self);
    fn reconcile(&self, persisted: &Self) -> Self;
    fn zeroed_baseline(&self) -> Self;
}

/// 📊 A metric kind: a mergeable row that knows its own aggregation key.
pub trait Metric:
    Mergeable + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// 🏷️ Role name, used for channel group names and log lines.
    const NAME: &'static str;

    /// 🔒 Insert-only kinds never update a row that already exists in storage.
    const SUPPORTS_UPDATE: bool = true;

    /// 🔑 Usually `<entity-id>_<time-bucket>`. Must be stable for the life of the bucket.
    fn aggregation_key(&self) -> String;
}

/// 🏗️ Declare a metric row struct and derive its [`Mergeable`] impl.
///
/// Every field starts with `#[merge(identity)]`, `#[merge(replace)]`, or
/// `#[merge(accumulate)]` (optionally `#[merge(accumulate, running_total)]`; the default
/// policy is `reset_on_flush`). Other field attributes go after the merge attribute.
///
/// ```ignore
/// metric_row! {
///     #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
///     pub struct Calls {
///         #[merge(identity)]
///         pub service_id: String,
///         #[merge(accumulate)]
///         pub calls: i64,
///     }
/// }
/// ```
#[macro_export]
macro_rules! metric_row {
    (
        $(#[$meta:meta])*
        $vis:vis struct $name:ident {
            $(
                #[merge($op:ident $(, $policy:ident)?)]
                $(#[$field_meta:meta])*
                $field_vis:vis $field:ident : $ty:ty
            ),* $(,)?
        }
    ) => {
        $(#[$meta])*
        $vis struct $name {
            $(
                $(#[$field_meta])*
                $field_vis $field: $ty,
            )*
        }

        impl $crate::merge::Mergeable for $name {
            const COLUMNS: &'static [$crate::merge::ColumnDescriptor] = &[
                $(
                    $crate::merge::ColumnDescriptor {
                        name: stringify!($field),
                        kind: <$ty as $crate::merge::ColumnValue>::KIND,
                        merge: $crate::__merge_op!($op $(, $policy)?),
                        flush: $crate::__flush_policy!($op $(, $policy)?),
                    },
                )*
            ];

            fn combine(&mut self, incoming: &Self) {
                let _ = incoming;
                $( $crate::__combine_field!($op $(, $policy)?; self.$field, incoming.$field); )*
            }

            fn take_unflushed(&mut self, baseline: &mut Self) -> Self {
                let _ = &baseline;
                Self {
                    $(
                        $field: $crate::__take_field!($op $(, $policy)?; self.$field, baseline.$field),
                    )*
                }
            }

            fn restore_unflushed(&mut self, baseline: &mut Self, taken: &Self) {
                let _ = (&baseline, taken);
                $( $crate::__restore_field!($op $(, $policy)?; self.$field, baseline.$field, taken.$field); )*
            }

            fn reconcile(&self, persisted: &Self) -> Self {
                Self {
                    $(
                        $field: $crate::__reconcile_field!($op $(, $policy)?; self.$field, persisted.$field),
                    )*
                }
            }

            fn zeroed_baseline(&self) -> Self {
                Self {
                    $(
                        $field: $crate::__zero_field!($op $(, $policy)?; self.$field),
                    )*
                }
            }
        }
    };
}

#[doc(hidden)]
#[macro_export]
macro_rules! __merge_op {
    (identity) => {
        $crate::merge::MergeOp::Identity
    };
    (replace) => {
        $crate::merge::MergeOp::Replace
    };
    (accumulate $(, $policy:ident)?) => {
        $crate::merge::MergeOp::Accumulate
    };
}

#[doc(hidden)]
#[macro_export]
macro_rules! __flush_policy {
    (identity) => {
        None
    };
    (replace) => {
        None
    };
    (accumulate) => {
        Some($crate::merge::FlushPolicy::ResetOnFlush)
    };
    (accumulate, reset_on_flush) => {
        Some($crate::merge::FlushPolicy::ResetOnFlush)
    };
    (accumulate, running_total) => {
        Some($crate::merge::FlushPolicy::RunningTotal)
    };
}

#[doc(hidden)]
#[macro_export]
macro_rules! __combine_field {
    (identity; $acc:expr, $incoming:expr) => {};
    (replace; $acc:expr, $incoming:expr) => {
        $acc = ::core::clone::Clone::clone(&$incoming)
    };
    (accumulate $(, $policy:ident)?; $acc:expr, $incoming:expr) => {
        $crate::merge::Summable::accumulate(&mut $acc, &$incoming)
    };
}

#[doc(hidden)]
#[macro_export]
macro_rules! __take_field {
    (identity; $current:expr, $baseline:expr) => {
        ::core::clone::Clone::clone(&$current)
    };
    (replace; $current:expr, $baseline:expr) => {
        ::core::clone::Clone::clone(&$current)
    };
    (accumulate; $current:expr, $baseline:expr) => {
        $crate::__take_field!(accumulate, reset_on_flush; $current, $baseline)
    };
    (accumulate, reset_on_flush; $current:expr, $baseline:expr) => {
        ::core::mem::replace(&mut $current, $crate::merge::Summable::zero())
    };
    (accumulate, running_total; $current:expr, $baseline:expr) => {{
        let mut delta = ::core::clone::Clone::clone(&$current);
        $crate::merge::Summable::retract(&mut delta, &$baseline);
        $baseline = ::core::clone::Clone::clone(&$current);
        delta
    }};
}

#[doc(hidden)]
#[macro_export]
macro_rules! __restore_field {
    (identity; $current:expr, $baseline:expr, $taken:expr) => {};
    (replace; $current:expr, $baseline:expr, $taken:expr) => {};
    (accumulate; $current:expr, $baseline:expr, $taken:expr) => {
        $crate::__restore_field!(accumulate, reset_on_flush; $current, $baseline, $taken)
    };
    (accumulate, reset_on_flush; $current:expr, $baseline:expr, $taken:expr) => {
        $crate::merge::Summable::accumulate(&mut $current, &$taken)
    };
    (accumulate, running_total; $current:expr, $baseline:expr, $taken:expr) => {
        $crate::merge::Summable::retract(&mut $baseline, &$taken)
    };
}

#[doc(hidden)]
#[macro_export]
macro_rules! __reconcile_field {
    (identity; $mine:expr, $persisted:expr) => {
        ::core::clone::Clone::clone(&$persisted)
    };
    (replace; $mine:expr, $persisted:expr) => {
        ::core::clone::Clone::clone(&$mine)
    };
    (accumulate $(, $policy:ident)?; $mine:expr, $persisted:expr) => {{
        let mut merged = ::core::clone::Clone::clone(&$persisted);
        $crate::merge::Summable::accumulate(&mut merged, &$mine);
        merged
    }};
}

#[doc(hidden)]
#[macro_export]
macro_rules! __zero_field {
    (identity; $current:expr) => {
        ::core::clone::Clone::clone(&$current)
    };
    (replace; $current:expr) => {
        ::core::clone::Clone::clone(&$current)
    };
    (accumulate $(, $policy:ident)?; $current:expr) => {
        $crate::merge::Summable::zero()
    };
}
