use crate::engine::EngineResult;
use std::rc::Rc;

pub type ValueRef = Rc<dyn DebugValue>;

/// Primitive payload of a value.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Scalar {
    Signed(i64),
    Unsigned(u64),
    Float(f64),
    Bool(bool),
    Char(char),
}

impl Scalar {
    /// Raw bits truncated to `size` bytes.
    pub fn bits(self, size: usize) -> u64 {
        let raw = match self {
            Scalar::Signed(v) => v as u64,
            Scalar::Unsigned(v) => v,
            Scalar::Float(v) if size == 4 => (v as f32).to_bits() as u64,
            Scalar::Float(v) => v.to_bits(),
            Scalar::Bool(v) => v as u64,
            Scalar::Char(v) => v as u64,
        };
        if size == 0 || size >= 8 {
            raw
        } else {
            raw & ((1u64 << (size * 8)) - 1)
        }
    }
}

/// Typed memory location owned by the engine.
pub trait DebugValue {
    fn name(&self) -> Option<String>;
    fn type_name(&self) -> Option<String>;

    /// Error text when the value could not be read.
    fn error(&self) -> Option<String> {
        None
    }

    /// Default textual representation of a primitive value.
    fn value(&self) -> Option<String>;

    /// Summary attached by a formatter, e.g. string contents of a pointer.
    fn summary(&self) -> Option<String> {
        None
    }

    fn scalar(&self) -> Option<Scalar> {
        None
    }

    fn byte_size(&self) -> usize;

    /// Raw bytes of the value.
    fn data(&self) -> Option<Vec<u8>> {
        None
    }

    fn num_children(&self) -> usize;
    fn child_at_index(&self, index: usize) -> Option<ValueRef>;

    fn child_member_with_name(&self, name: &str) -> Option<ValueRef> {
        (0..self.num_children())
            .filter_map(|i| self.child_at_index(i))
            .find(|child| child.name().as_deref() == Some(name))
    }

    /// Resolve a `.field`/`[idx]` path relative to this value.
    fn value_for_expression_path(&self, _path: &str) -> Option<ValueRef> {
        None
    }

    fn is_synthetic(&self) -> bool {
        false
    }

    fn non_synthetic_value(&self) -> Option<ValueRef> {
        None
    }

    fn set_value_from_str(&self, literal: &str) -> EngineResult<()>;

    /// Expression that evaluates back to this value.
    fn expression_path(&self) -> Option<String> {
        None
    }
}

/// Numeric-like view over any debugger value.
pub trait NumericValue {
    fn as_signed(&self) -> Option<i64>;
    fn as_unsigned(&self) -> Option<u64>;
    fn as_float(&self) -> Option<f64>;
    fn as_string(&self) -> Option<String>;
    fn field(&self, name: &str) -> Option<ValueRef>;
}

impl<T: DebugValue + ?Sized> NumericValue for T {
    fn as_signed(&self) -> Option<i64> {
        match self.scalar()? {
            Scalar::Signed(v) => Some(v),
            Scalar::Unsigned(v) => i64::try_from(v).ok(),
            Scalar::Float(v) => Some(v as i64),
            Scalar::Bool(v) => Some(v as i64),
            Scalar::Char(v) => Some(v as i64),
        }
    }

    fn as_unsigned(&self) -> Option<u64> {
        match self.scalar()? {
            Scalar::Unsigned(v) => Some(v),
            Scalar::Signed(v) => Some(v as u64),
            Scalar::Float(v) => Some(v as u64),
            Scalar::Bool(v) => Some(v as u64),
            Scalar::Char(v) => Some(v as u64),
        }
    }

    fn as_float(&self) -> Option<f64> {
        match self.scalar()? {
            Scalar::Float(v) => Some(v),
            Scalar::Signed(v) => Some(v as f64),
            Scalar::Unsigned(v) => Some(v as f64),
            Scalar::Bool(v) => Some(v as u8 as f64),
            Scalar::Char(v) => Some(v as u32 as f64),
        }
    }

    fn as_string(&self) -> Option<String> {
        if let Some(summary) = self.summary() {
            return Some(summary.trim_matches('"').to_string());
        }
        let data = self.data()?;
        let end = data.iter().position(|b| *b == 0).unwrap_or(data.len());
        Some(String::from_utf8_lossy(&data[..end]).into_owned())
    }

    fn field(&self, name: &str) -> Option<ValueRef> {
        self.child_member_with_name(name)
    }
}
