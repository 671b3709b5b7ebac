//! Synthetic child providers.
//!
//! A provider replaces the child layout of values whose type name matches a regex. Providers are
//! instantiated per value on first access and refreshed when the value changes.

use crate::engine::{DebugValue, EngineResult, Scalar, ValueRef};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::rc::Rc;
use strum_macros::{Display, EnumString};

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, EnumString, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ProviderKind {
    /// Show the children of one member as the children of the value itself.
    #[default]
    Hoist,
}

/// Provider registration, an entry of the `syntheticProviders` setting.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderSpec {
    pub type_regex: String,
    #[serde(default)]
    pub provider: ProviderKind,
    pub member: String,
}

impl ProviderSpec {
    fn instantiate(&self) -> Box<dyn SyntheticChildren> {
        match self.provider {
            ProviderKind::Hoist => Box::new(Hoist {
                member: self.member.clone(),
                children: vec![],
            }),
        }
    }
}

pub trait SyntheticChildren {
    /// Recompute the layout from the underlying value.
    fn update(&mut self, value: &dyn DebugValue);
    fn num_children(&self) -> usize;
    fn child_at_index(&self, index: usize) -> Option<ValueRef>;
}

struct Hoist {
    member: String,
    children: Vec<ValueRef>,
}

impl SyntheticChildren for Hoist {
    fn update(&mut self, value: &dyn DebugValue) {
        self.children = value
            .child_member_with_name(&self.member)
            .map(|member| {
                (0..member.num_children())
                    .filter_map(|i| member.child_at_index(i))
                    .collect()
            })
            .unwrap_or_default();
    }

    fn num_children(&self) -> usize {
        self.children.len()
    }

    fn child_at_index(&self, index: usize) -> Option<ValueRef> {
        self.children.get(index).cloned()
    }
}

struct NoChildren;

impl SyntheticChildren for NoChildren {
    fn update(&mut self, _: &dyn DebugValue) {}

    fn num_children(&self) -> usize {
        0
    }

    fn child_at_index(&self, _: usize) -> Option<ValueRef> {
        None
    }
}

static NO_CHILDREN: NoChildren = NoChildren;

/// Provider that is only built when its children are first needed.
pub enum LazyProvider {
    Pending(ProviderSpec),
    Ready(Box<dyn SyntheticChildren>),
}

impl LazyProvider {
    pub fn ensure_ready(&mut self, value: &dyn DebugValue) -> &dyn SyntheticChildren {
        if let LazyProvider::Pending(spec) = self {
            log::debug!(target: "session", "instantiate {} provider for {}", spec.provider, spec.type_regex);
            let mut provider = spec.instantiate();
            provider.update(value);
            *self = LazyProvider::Ready(provider);
        }
        match self {
            LazyProvider::Ready(provider) => &**provider,
            LazyProvider::Pending(_) => &NO_CHILDREN,
        }
    }

    pub fn update(&mut self, value: &dyn DebugValue) {
        match self {
            LazyProvider::Ready(provider) => provider.update(value),
            LazyProvider::Pending(_) => {
                self.ensure_ready(value);
            }
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, LazyProvider::Ready(_))
    }
}

/// Value whose children come from a provider.
pub struct SyntheticValue {
    inner: ValueRef,
    provider: RefCell<LazyProvider>,
}

impl SyntheticValue {
    pub fn new(inner: ValueRef, spec: ProviderSpec) -> Self {
        Self {
            inner,
            provider: RefCell::new(LazyProvider::Pending(spec)),
        }
    }
}

impl DebugValue for SyntheticValue {
    fn name(&self) -> Option<String> {
        self.inner.name()
    }

    fn type_name(&self) -> Option<String> {
        self.inner.type_name()
    }

    fn error(&self) -> Option<String> {
        self.inner.error()
    }

    fn value(&self) -> Option<String> {
        self.inner.value()
    }

    fn summary(&self) -> Option<String> {
        self.inner.summary()
    }

    fn scalar(&self) -> Option<Scalar> {
        self.inner.scalar()
    }

    fn byte_size(&self) -> usize {
        self.inner.byte_size()
    }

    fn data(&self) -> Option<Vec<u8>> {
        self.inner.data()
    }

    fn num_children(&self) -> usize {
        self.provider
            .borrow_mut()
            .ensure_ready(self.inner.as_ref())
            .num_children()
    }

    fn child_at_index(&self, index: usize) -> Option<ValueRef> {
        self.provider
            .borrow_mut()
            .ensure_ready(self.inner.as_ref())
            .child_at_index(index)
    }

    fn value_for_expression_path(&self, path: &str) -> Option<ValueRef> {
        self.inner.value_for_expression_path(path)
    }

    fn is_synthetic(&self) -> bool {
        true
    }

    fn non_synthetic_value(&self) -> Option<ValueRef> {
        Some(self.inner.clone())
    }

    fn set_value_from_str(&self, literal: &str) -> EngineResult<()> {
        self.inner.set_value_from_str(literal)?;
        self.provider.borrow_mut().update(self.inner.as_ref());
        Ok(())
    }

    fn expression_path(&self) -> Option<String> {
        self.inner.expression_path()
    }
}

/// Type name keyed provider registry.
#[derive(Default)]
pub struct Formatters {
    entries: Vec<(Regex, ProviderSpec)>,
}

impl Formatters {
    /// Registry of `specs`, entries with a malformed regex are skipped.
    pub fn new(specs: &[ProviderSpec]) -> Self {
        let entries = specs
            .iter()
            .filter_map(|spec| {
                let re = crate::weak_error!(
                    Regex::new(&spec.type_regex),
                    "skip synthetic provider:"
                )?;
                Some((re, spec.clone()))
            })
            .collect();
        Self { entries }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Attach the first matching provider to `value`.
    pub fn wrap(&self, value: ValueRef) -> ValueRef {
        if value.is_synthetic() || self.entries.is_empty() {
            return value;
        }
        let Some(type_name) = value.type_name() else {
            return value;
        };
        match self.entries.iter().find(|(re, _)| re.is_match(&type_name)) {
            Some((_, spec)) => Rc::new(SyntheticValue::new(value, spec.clone())),
            None => value,
        }
    }
}
