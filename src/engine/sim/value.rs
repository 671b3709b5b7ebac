use crate::engine::sim::program::ValueSpec;
use crate::engine::{DebugValue, EngineError, EngineResult, Scalar, ValueRef};
use std::cell::RefCell;
use std::rc::Rc;

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
}

/// Mutable value storage shared by every [`SimValue`] pointing to it.
#[derive(Debug)]
pub struct SimNode {
    pub name: String,
    pub type_name: String,
    pub path: String,
    literal: RefCell<Option<Literal>>,
    summary: Option<String>,
    error: Option<String>,
    children: Vec<Rc<SimNode>>,
    synthetic: bool,
    raw: Vec<Rc<SimNode>>,
}

fn literal_from_toml(value: &toml::Value) -> Option<Literal> {
    match value {
        toml::Value::Integer(v) => Some(Literal::Int(*v)),
        toml::Value::Float(v) => Some(Literal::Float(*v)),
        toml::Value::Boolean(v) => Some(Literal::Bool(*v)),
        toml::Value::String(v) => Some(Literal::Str(v.clone())),
        _ => None,
    }
}

fn child_path(parent: &str, name: &str) -> String {
    if name.starts_with('[') {
        format!("{parent}{name}")
    } else {
        format!("{parent}.{name}")
    }
}

impl SimNode {
    pub fn build(spec: &ValueSpec, parent_path: Option<&str>) -> Rc<SimNode> {
        let path = match parent_path {
            None => spec.name.clone(),
            Some(parent) => child_path(parent, &spec.name),
        };
        let children = spec
            .children
            .iter()
            .map(|c| SimNode::build(c, Some(&path)))
            .collect();
        let raw = spec
            .raw
            .iter()
            .map(|c| SimNode::build(c, Some(&path)))
            .collect();
        Rc::new(SimNode {
            name: spec.name.clone(),
            type_name: spec.type_name.clone(),
            literal: RefCell::new(spec.value.as_ref().and_then(literal_from_toml)),
            summary: spec.summary.clone(),
            error: spec.error.clone(),
            children,
            synthetic: spec.synthetic,
            raw,
            path,
        })
    }

    pub fn scalar(name: &str, type_name: &str, literal: Literal) -> Rc<SimNode> {
        Rc::new(SimNode {
            name: name.to_string(),
            type_name: type_name.to_string(),
            path: name.to_string(),
            literal: RefCell::new(Some(literal)),
            summary: None,
            error: None,
            children: vec![],
            synthetic: false,
            raw: vec![],
        })
    }

    pub fn aggregate(name: &str, type_name: &str, children: Vec<Rc<SimNode>>) -> Rc<SimNode> {
        Rc::new(SimNode {
            name: name.to_string(),
            type_name: type_name.to_string(),
            path: name.to_string(),
            literal: RefCell::new(None),
            summary: None,
            error: None,
            children,
            synthetic: false,
            raw: vec![],
        })
    }

    pub fn literal(&self) -> Option<Literal> {
        self.literal.borrow().clone()
    }

    pub fn children(&self) -> &[Rc<SimNode>] {
        &self.children
    }
}

fn is_unsigned_type(ty: &str) -> bool {
    let ty = ty.trim();
    ty.starts_with("unsigned")
        || ty.ends_with('*')
        || matches!(ty, "u8" | "u16" | "u32" | "u64" | "usize" | "size_t")
}

fn is_char_type(ty: &str) -> bool {
    matches!(ty.trim(), "char" | "signed char" | "unsigned char")
}

fn is_float_type(ty: &str) -> bool {
    matches!(ty.trim(), "float" | "double" | "f32" | "f64")
}

fn type_size(ty: &str) -> usize {
    let ty = ty.trim();
    if ty.ends_with('*') {
        return 8;
    }
    match ty {
        "char" | "signed char" | "unsigned char" | "bool" | "i8" | "u8" => 1,
        "short" | "unsigned short" | "i16" | "u16" => 2,
        "int" | "unsigned int" | "unsigned" | "float" | "i32" | "u32" | "f32" => 4,
        _ => 8,
    }
}

fn parse_int(text: &str) -> Option<i64> {
    let text = text.trim();
    let (negative, digits) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text),
    };
    let value = if let Some(hex) = digits
        .strip_prefix("0x")
        .or_else(|| digits.strip_prefix("0X"))
    {
        u64::from_str_radix(hex, 16).ok()? as i64
    } else if let Some(bin) = digits.strip_prefix("0b") {
        u64::from_str_radix(bin, 2).ok()? as i64
    } else {
        digits.parse::<i64>().ok()?
    };
    Some(if negative { -value } else { value })
}

/// Engine-side value handle.
pub struct SimValue {
    node: Rc<SimNode>,
    raw_view: bool,
}

impl SimValue {
    pub fn new(node: Rc<SimNode>) -> ValueRef {
        Rc::new(SimValue {
            node,
            raw_view: false,
        })
    }

    fn visible_children(&self) -> &[Rc<SimNode>] {
        if self.node.synthetic && self.raw_view {
            &self.node.raw
        } else {
            &self.node.children
        }
    }
}

impl DebugValue for SimValue {
    fn name(&self) -> Option<String> {
        Some(self.node.name.clone())
    }

    fn type_name(&self) -> Option<String> {
        Some(self.node.type_name.clone())
    }

    fn error(&self) -> Option<String> {
        self.node.error.clone()
    }

    fn value(&self) -> Option<String> {
        let literal = self.node.literal()?;
        Some(match (literal, self.scalar()) {
            (Literal::Str(s), _) => s,
            (_, Some(Scalar::Char(c))) => format!("'{c}'"),
            (_, Some(Scalar::Unsigned(v))) => v.to_string(),
            (_, Some(Scalar::Signed(v))) => v.to_string(),
            (_, Some(Scalar::Float(v))) => v.to_string(),
            (_, Some(Scalar::Bool(v))) => v.to_string(),
            (Literal::Int(v), None) => v.to_string(),
            (Literal::Float(v), None) => v.to_string(),
            (Literal::Bool(v), None) => v.to_string(),
        })
    }

    fn summary(&self) -> Option<String> {
        self.node.summary.clone()
    }

    fn scalar(&self) -> Option<Scalar> {
        let ty = &self.node.type_name;
        match self.node.literal()? {
            Literal::Int(v) if is_char_type(ty) => {
                Some(Scalar::Char(char::from_u32(v as u32).unwrap_or('?')))
            }
            Literal::Int(v) if is_float_type(ty) => Some(Scalar::Float(v as f64)),
            Literal::Int(v) if is_unsigned_type(ty) => Some(Scalar::Unsigned(v as u64)),
            Literal::Int(v) => Some(Scalar::Signed(v)),
            Literal::Float(v) => Some(Scalar::Float(v)),
            Literal::Bool(v) => Some(Scalar::Bool(v)),
            Literal::Str(s) => {
                let hex = s.strip_prefix("0x")?;
                u64::from_str_radix(hex, 16).ok().map(Scalar::Unsigned)
            }
        }
    }

    fn byte_size(&self) -> usize {
        type_size(&self.node.type_name)
    }

    fn data(&self) -> Option<Vec<u8>> {
        if let Some(summary) = &self.node.summary {
            let mut bytes = summary.trim_matches('"').as_bytes().to_vec();
            bytes.push(0);
            return Some(bytes);
        }
        let size = self.byte_size();
        let bits = self.scalar()?.bits(size);
        Some(bits.to_le_bytes()[..size.min(8)].to_vec())
    }

    fn num_children(&self) -> usize {
        self.visible_children().len()
    }

    fn child_at_index(&self, index: usize) -> Option<ValueRef> {
        self.visible_children()
            .get(index)
            .map(|n| SimValue::new(n.clone()))
    }

    fn value_for_expression_path(&self, path: &str) -> Option<ValueRef> {
        let mut node = self.node.clone();
        for part in split_path(path)? {
            node = node.children.iter().find(|c| c.name == part)?.clone();
        }
        Some(SimValue::new(node))
    }

    fn is_synthetic(&self) -> bool {
        self.node.synthetic && !self.raw_view
    }

    fn non_synthetic_value(&self) -> Option<ValueRef> {
        if !self.node.synthetic {
            return None;
        }
        Some(Rc::new(SimValue {
            node: self.node.clone(),
            raw_view: true,
        }))
    }

    fn set_value_from_str(&self, literal: &str) -> EngineResult<()> {
        let ty = self.node.type_name.clone();
        let current = self.node.literal().ok_or_else(|| {
            EngineError::new(format!("Cannot assign to a value of type '{ty}'"))
        })?;
        let parse_err = || EngineError::new(format!("Could not parse '{literal}' as '{ty}'"));
        let literal = literal.trim();
        let new = match current {
            Literal::Int(_) if is_char_type(&ty) && literal.len() == 3 && literal.starts_with('\'') => {
                Literal::Int(literal.chars().nth(1).ok_or_else(parse_err)? as i64)
            }
            Literal::Int(_) => Literal::Int(parse_int(literal).ok_or_else(parse_err)?),
            Literal::Float(_) => Literal::Float(literal.parse().map_err(|_| parse_err())?),
            Literal::Bool(_) => Literal::Bool(literal.parse().map_err(|_| parse_err())?),
            Literal::Str(_) => Literal::Str(literal.to_string()),
        };
        *self.node.literal.borrow_mut() = Some(new);
        Ok(())
    }

    fn expression_path(&self) -> Option<String> {
        Some(self.node.path.clone())
    }
}

/// Split `a.b[2].c` into `["a", "b", "[2]", "c"]`; leading `.` is optional.
pub fn split_path(path: &str) -> Option<Vec<String>> {
    let mut parts = vec![];
    let mut current = String::new();
    let mut chars = path.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '.' => {
                if !current.is_empty() {
                    parts.push(std::mem::take(&mut current));
                }
            }
            '[' => {
                if !current.is_empty() {
                    parts.push(std::mem::take(&mut current));
                }
                let mut index = String::from("[");
                loop {
                    let c = chars.next()?;
                    index.push(c);
                    if c == ']' {
                        break;
                    }
                }
                parts.push(index);
            }
            c if c.is_alphanumeric() || c == '_' || c == '$' => current.push(c),
            c if c.is_whitespace() => {}
            _ => return None,
        }
    }
    if !current.is_empty() {
        parts.push(current);
    }
    Some(parts)
}
