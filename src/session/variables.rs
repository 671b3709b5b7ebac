//! Scopes, variables and expression evaluation.

use crate::dap::protocol::{DapRequest, Variable};
use crate::engine::{
    DebugValue, EngineError, EngineResult, FrameRef, Scalar, ValueRef, VariableScope,
};
use crate::error::{Error, Result};
use crate::session::format::{parse_expression_format, render_value, Format};
use crate::session::handles::Handle;
use crate::session::{parse_args, DebugSession, HandlerResult};
use indexmap::IndexMap;
use serde::Deserialize;
use serde_json::{json, Value};
use std::rc::Rc;

/// Object behind a variables reference.
#[derive(Clone)]
pub enum Container {
    StackFrame(FrameRef),
    Locals(FrameRef),
    Statics(FrameRef),
    Registers(FrameRef),
    /// Compound value, children are shown in the format (if any) of the expression it came from.
    Value(ValueRef, Option<Format>),
}

/// First `len` children of a value, the `expr,[N]` view.
struct ArrayView {
    inner: ValueRef,
    len: usize,
}

impl DebugValue for ArrayView {
    fn name(&self) -> Option<String> {
        self.inner.name()
    }

    fn type_name(&self) -> Option<String> {
        self.inner
            .type_name()
            .map(|t| format!("{t} [{}]", self.len))
    }

    fn value(&self) -> Option<String> {
        None
    }

    fn scalar(&self) -> Option<Scalar> {
        None
    }

    fn byte_size(&self) -> usize {
        self.inner.byte_size()
    }

    fn num_children(&self) -> usize {
        self.len
    }

    fn child_at_index(&self, index: usize) -> Option<ValueRef> {
        if index < self.len {
            self.inner.child_at_index(index)
        } else {
            None
        }
    }

    fn set_value_from_str(&self, _: &str) -> EngineResult<()> {
        Err(EngineError::new("array view is read only"))
    }

    fn expression_path(&self) -> Option<String> {
        self.inner.expression_path()
    }
}

fn array_view(value: ValueRef, len: u32) -> ValueRef {
    let len = (len as usize).min(value.num_children());
    Rc::new(ArrayView { inner: value, len })
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ScopesArguments {
    frame_id: Handle,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct VariablesArguments {
    variables_reference: Handle,
    #[serde(default)]
    start: Option<usize>,
    #[serde(default)]
    count: Option<usize>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct EvaluateArguments {
    expression: String,
    #[serde(default)]
    frame_id: Option<Handle>,
    #[serde(default)]
    context: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SetVariableArguments {
    variables_reference: Handle,
    name: String,
    value: String,
}

const RAW_CHILD: &str = "[raw]";

impl DebugSession {
    pub(super) fn frame_of(&self, handle: Handle) -> Option<FrameRef> {
        match self.handles.get(handle) {
            Some(Container::StackFrame(frame)) => Some(*frame),
            _ => None,
        }
    }

    pub(super) fn handle_scopes(&mut self, req: &DapRequest) -> Result<HandlerResult> {
        let args: ScopesArguments = parse_args(req)?;
        let frame = self
            .frame_of(args.frame_id)
            .ok_or_else(|| Error::user("Invalid frame reference"))?;
        let parent = Some(args.frame_id);
        let locals = self.handles.create(Container::Locals(frame), "[locs]", parent);
        let statics = self.handles.create(Container::Statics(frame), "[stat]", parent);
        let registers = self
            .handles
            .create(Container::Registers(frame), "[regs]", parent);
        Ok(HandlerResult::Body(json!({
            "scopes": [
                {"name": "Local", "variablesReference": locals, "expensive": false},
                {"name": "Static", "variablesReference": statics, "expensive": false},
                {"name": "Registers", "variablesReference": registers, "expensive": false},
            ]
        })))
    }

    pub(super) fn handle_variables(&mut self, req: &DapRequest) -> Result<HandlerResult> {
        let args: VariablesArguments = parse_args(req)?;
        let parent = args.variables_reference;
        let Some(container) = self.handles.get(parent).cloned() else {
            log::debug!(target: "session", "stale variables reference {parent}");
            return Ok(HandlerResult::Body(json!({ "variables": [] })));
        };

        let (values, format, raw) = match container {
            Container::StackFrame(_) => (vec![], None, None),
            Container::Locals(frame) => (self.engine.variables(frame, VariableScope::Locals), None, None),
            Container::Statics(frame) => (self.engine.variables(frame, VariableScope::Statics), None, None),
            Container::Registers(frame) => (self.engine.registers(frame), None, None),
            Container::Value(value, format) => {
                let children = (0..value.num_children())
                    .filter_map(|i| value.child_at_index(i))
                    .collect();
                let raw = value
                    .is_synthetic()
                    .then(|| value.non_synthetic_value())
                    .flatten();
                (children, format, raw)
            }
        };

        // a name declared twice (shadowing) shows the innermost declaration
        let mut by_name: IndexMap<String, ValueRef> = IndexMap::new();
        for (i, value) in values.into_iter().enumerate() {
            let name = value.name().unwrap_or_else(|| format!("[{i}]"));
            by_name.insert(name, value);
        }

        let total = by_name.len();
        let start = args.start.unwrap_or(0);
        let count = args.count.filter(|c| *c > 0).unwrap_or(usize::MAX);
        let last_page = start.saturating_add(count) >= total;
        let mut variables: Vec<Variable> = by_name
            .into_iter()
            .skip(start)
            .take(count)
            .map(|(name, value)| self.variable(value, name, parent, format, true))
            .collect();
        // the raw view follows the last child
        if let Some(raw) = raw.filter(|_| last_page) {
            variables.push(self.variable(raw, RAW_CHILD.to_string(), parent, format, false));
        }
        Ok(HandlerResult::Body(json!({ "variables": variables })))
    }

    /// Variable entry for `value`, registering a handle if it can be expanded.
    fn variable(
        &mut self,
        value: ValueRef,
        name: String,
        parent: Handle,
        format: Option<Format>,
        use_formatters: bool,
    ) -> Variable {
        let value = if use_formatters {
            self.formatters.wrap(value)
        } else {
            value
        };
        let shown_as = format.unwrap_or_else(|| self.display_format.into());
        let variables_reference = if value.num_children() > 0 || value.is_synthetic() {
            self.handles
                .create(Container::Value(value.clone(), format), &name, Some(parent))
        } else {
            0
        };
        Variable {
            value: render_value(value.as_ref(), shown_as),
            type_name: value.type_name(),
            variables_reference,
            evaluate_name: value.expression_path(),
            name,
        }
    }

    pub(super) fn handle_evaluate(&mut self, req: &DapRequest) -> Result<HandlerResult> {
        let args: EvaluateArguments = parse_args(req)?;
        let frame = args.frame_id.and_then(|h| self.frame_of(h));

        if args.context.as_deref() != Some("repl") {
            return self
                .evaluate_expression(&args.expression, frame)
                .map(HandlerResult::Body)
                .map_err(|e| match e {
                    Error::Internal(e) => Error::Internal(e),
                    e => Error::UserQuiet(e.to_string()),
                });
        }

        let empty = json!({"result": "", "variablesReference": 0});
        match args.expression.strip_prefix('?') {
            Some(expression) => match self.evaluate_expression(expression.trim(), frame) {
                Ok(body) => Ok(HandlerResult::Body(body)),
                Err(Error::Internal(e)) => Err(Error::Internal(e)),
                Err(e) => {
                    self.console_message(e.to_string());
                    Ok(HandlerResult::Body(empty))
                }
            },
            None => {
                let output = self.engine.execute_command(&args.expression, frame);
                if !output.output.is_empty() {
                    self.console_message(output.output.trim_end());
                }
                if !output.succeeded && !output.error.is_empty() {
                    self.console_message(output.error.trim_end());
                }
                Ok(HandlerResult::Body(empty))
            }
        }
    }

    fn evaluate_expression(&mut self, expression: &str, frame: Option<FrameRef>) -> Result<Value> {
        let (expr, spec) = parse_expression_format(expression).map_err(Error::User)?;
        let value = self.engine.evaluate(expr, frame)?;
        if let Some(err) = value.error() {
            return Err(Error::User(err));
        }
        let value = match spec.array {
            Some(len) => array_view(value, len),
            None => value,
        };
        let value = self.formatters.wrap(value);
        let format = spec.format.unwrap_or_else(|| self.display_format.into());
        let handle = if value.num_children() > 0 || value.is_synthetic() {
            self.handles
                .create(Container::Value(value.clone(), spec.format), expression, None)
        } else {
            0
        };
        let mut body = json!({
            "result": render_value(value.as_ref(), format),
            "variablesReference": handle,
        });
        if let Some(type_name) = value.type_name() {
            body["type"] = json!(type_name);
        }
        Ok(body)
    }

    pub(super) fn handle_set_variable(&mut self, req: &DapRequest) -> Result<HandlerResult> {
        let args: SetVariableArguments = parse_args(req)?;
        let container = self
            .handles
            .get(args.variables_reference)
            .cloned()
            .ok_or_else(|| Error::user("Invalid variables reference"))?;
        let name = args.name.as_str();

        let (target, format) = match &container {
            Container::StackFrame(_) => (None, None),
            Container::Locals(frame) => (self.engine.find_variable(*frame, name), None),
            Container::Statics(frame) => (
                self.engine
                    .variables(*frame, VariableScope::Statics)
                    .into_iter()
                    .find(|v| v.name().as_deref() == Some(name)),
                None,
            ),
            Container::Registers(frame) => (
                self.engine
                    .registers(*frame)
                    .into_iter()
                    .find_map(|set| set.child_member_with_name(name)),
                None,
            ),
            Container::Value(value, format) => (
                value
                    .child_member_with_name(name)
                    .or_else(|| value.value_for_expression_path(name)),
                *format,
            ),
        };
        let target =
            target.ok_or_else(|| Error::user(format!("Could not find variable '{name}'")))?;
        target.set_value_from_str(&args.value)?;

        let format = format.unwrap_or_else(|| self.display_format.into());
        Ok(HandlerResult::Body(json!({
            "value": render_value(target.as_ref(), format),
            "type": target.type_name(),
            "variablesReference": 0,
        })))
    }
}
