//! Aggregation expressions evaluated against a single document.
//!
//! Evaluation returns `None` for a missing value. Comparisons treat missing
//! like `null`; `$set` skips missing results and object construction omits
//! them, matching the document store semantics the pipelines are written for.

use std::cmp::Ordering;

use rand::RngCore;
use serde_json::{Map, Value};

use crate::path::get_path;

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// `$path` reference into the current document.
    Field(String),
    Literal(Value),
    Eq(Box<Expr>, Box<Expr>),
    Ne(Box<Expr>, Box<Expr>),
    Gt(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
    And(Vec<Expr>),
    Or(Vec<Expr>),
    /// Membership of the value in a literal list.
    In(Box<Expr>, Vec<Value>),
    Cond {
        when: Box<Expr>,
        then: Box<Expr>,
        otherwise: Box<Expr>,
    },
    ToBool(Box<Expr>),
    /// Uniform float in `[0, 1)`.
    Rand,
    Object(Vec<(String, Expr)>),
    Array(Vec<Expr>),
    MergeObjects(Vec<Expr>),
}

impl Expr {
    pub fn field(path: impl Into<String>) -> Self {
        Self::Field(path.into())
    }

    pub fn lit(value: impl Into<Value>) -> Self {
        Self::Literal(value.into())
    }

    pub fn null() -> Self {
        Self::Literal(Value::Null)
    }

    pub fn eq(a: Expr, b: Expr) -> Self {
        Self::Eq(Box::new(a), Box::new(b))
    }

    pub fn ne(a: Expr, b: Expr) -> Self {
        Self::Ne(Box::new(a), Box::new(b))
    }

    pub fn gt(a: Expr, b: Expr) -> Self {
        Self::Gt(Box::new(a), Box::new(b))
    }

    pub fn not(a: Expr) -> Self {
        Self::Not(Box::new(a))
    }

    pub fn is_in(a: Expr, values: Vec<Value>) -> Self {
        Self::In(Box::new(a), values)
    }

    pub fn cond(when: Expr, then: Expr, otherwise: Expr) -> Self {
        Self::Cond {
            when: Box::new(when),
            then: Box::new(then),
            otherwise: Box::new(otherwise),
        }
    }

    pub fn to_bool(a: Expr) -> Self {
        Self::ToBool(Box::new(a))
    }

    /// `$gt: [expr, null]`: the value is present and not null.
    pub fn exists(a: Expr) -> Self {
        Self::gt(a, Self::null())
    }

    pub fn object<K: Into<String>>(fields: impl IntoIterator<Item = (K, Expr)>) -> Self {
        Self::Object(fields.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    pub fn eval(&self, doc: &Value, rng: &mut dyn RngCore) -> Option<Value> {
        match self {
            Self::Field(path) => get_path(doc, path),
            Self::Literal(v) => Some(v.clone()),
            Self::Eq(a, b) => Some(Value::Bool(
                compare(&a.eval(doc, rng), &b.eval(doc, rng)) == Ordering::Equal,
            )),
            Self::Ne(a, b) => Some(Value::Bool(
                compare(&a.eval(doc, rng), &b.eval(doc, rng)) != Ordering::Equal,
            )),
            Self::Gt(a, b) => Some(Value::Bool(
                compare(&a.eval(doc, rng), &b.eval(doc, rng)) == Ordering::Greater,
            )),
            Self::Not(a) => Some(Value::Bool(!truthy(&a.eval(doc, rng)))),
            Self::And(items) => Some(Value::Bool(
                items.iter().all(|e| truthy(&e.eval(doc, rng))),
            )),
            Self::Or(items) => Some(Value::Bool(
                items.iter().any(|e| truthy(&e.eval(doc, rng))),
            )),
            Self::In(a, values) => {
                let v = a.eval(doc, rng);
                Some(Value::Bool(values.iter().any(|candidate| {
                    compare(&v, &Some(candidate.clone())) == Ordering::Equal
                })))
            }
            Self::Cond {
                when,
                then,
                otherwise,
            } => {
                if truthy(&when.eval(doc, rng)) {
                    then.eval(doc, rng)
                } else {
                    otherwise.eval(doc, rng)
                }
            }
            Self::ToBool(a) => match a.eval(doc, rng) {
                None | Some(Value::Null) => Some(Value::Null),
                v => Some(Value::Bool(truthy(&v))),
            },
            Self::Rand => Some(Value::from(next_f64(rng))),
            Self::Object(fields) => {
                let mut map = Map::new();
                for (key, expr) in fields {
                    if let Some(v) = expr.eval(doc, rng) {
                        map.insert(key.clone(), v);
                    }
                }
                Some(Value::Object(map))
            }
            Self::Array(items) => Some(Value::Array(
                items
                    .iter()
                    .map(|e| e.eval(doc, rng).unwrap_or(Value::Null))
                    .collect(),
            )),
            Self::MergeObjects(items) => {
                let mut map = Map::new();
                for item in items {
                    if let Some(Value::Object(obj)) = item.eval(doc, rng) {
                        map.extend(obj);
                    }
                }
                Some(Value::Object(map))
            }
        }
    }
}

fn next_f64(rng: &mut dyn RngCore) -> f64 {
    // 53 random mantissa bits
    (rng.next_u64() >> 11) as f64 / (1u64 << 53) as f64
}

/// Truthiness: missing, null, false and numeric zero are false.
pub fn truthy(value: &Option<Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Some(_) => true,
    }
}

fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Number(_) => 1,
        Value::String(_) => 2,
        Value::Object(_) => 3,
        Value::Array(_) => 4,
        Value::Bool(_) => 5,
    }
}

/// Total order across JSON values: null < numbers < strings < objects <
/// arrays < booleans. Missing compares equal to null.
pub fn compare(a: &Option<Value>, b: &Option<Value>) -> Ordering {
    let null = Value::Null;
    let a = a.as_ref().unwrap_or(&null);
    let b = b.as_ref().unwrap_or(&null);
    compare_values(a, b)
}

pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Number(x), Value::Number(y)) => {
            let x = x.as_f64().unwrap_or(0.0);
            let y = y.as_f64().unwrap_or(0.0);
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Array(x), Value::Array(y)) => {
            for (xi, yi) in x.iter().zip(y.iter()) {
                let ord = compare_values(xi, yi);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        (Value::Object(x), Value::Object(y)) => {
            for ((kx, vx), (ky, vy)) in x.iter().zip(y.iter()) {
                let ord = kx.cmp(ky).then_with(|| compare_values(vx, vy));
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        _ => type_rank(a).cmp(&type_rank(b)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use serde_json::json;

    fn eval(expr: &Expr, doc: &Value) -> Option<Value> {
        let mut rng = StdRng::seed_from_u64(7);
        expr.eval(doc, &mut rng)
    }

    #[test]
    fn test_exists_and_sentinel() {
        let doc = json!({"a": "", "b": "xyz", "c": null});
        assert_eq!(eval(&Expr::exists(Expr::field("a")), &doc), Some(json!(true)));
        assert_eq!(eval(&Expr::exists(Expr::field("c")), &doc), Some(json!(false)));
        assert_eq!(eval(&Expr::exists(Expr::field("zz")), &doc), Some(json!(false)));
        assert_eq!(
            eval(&Expr::eq(Expr::field("a"), Expr::lit("")), &doc),
            Some(json!(true))
        );
        assert_eq!(
            eval(&Expr::ne(Expr::field("b"), Expr::lit("")), &doc),
            Some(json!(true))
        );
    }

    #[test]
    fn test_cond_and_to_bool() {
        let doc = json!({"x": 1, "y": 0});
        let expr = Expr::cond(
            Expr::exists(Expr::field("missing")),
            Expr::to_bool(Expr::field("missing")),
            Expr::to_bool(Expr::field("x")),
        );
        assert_eq!(eval(&expr, &doc), Some(json!(true)));
        assert_eq!(eval(&Expr::to_bool(Expr::field("y")), &doc), Some(json!(false)));
        assert_eq!(eval(&Expr::to_bool(Expr::field("nope")), &doc), Some(Value::Null));
    }

    #[test]
    fn test_object_omits_missing() {
        let doc = json!({"a": 1});
        let expr = Expr::object([("a", Expr::field("a")), ("b", Expr::field("b"))]);
        assert_eq!(eval(&expr, &doc), Some(json!({"a": 1})));
    }

    #[test]
    fn test_rand_range() {
        let mut rng = StdRng::seed_from_u64(1);
        for _ in 0..100 {
            let v = Expr::Rand.eval(&json!({}), &mut rng).unwrap();
            let f = v.as_f64().unwrap();
            assert!((0.0..1.0).contains(&f));
        }
    }

    #[test]
    fn test_compare_type_order() {
        assert_eq!(compare_values(&json!(null), &json!(0)), Ordering::Less);
        assert_eq!(compare_values(&json!(5), &json!("a")), Ordering::Less);
        assert_eq!(compare_values(&json!(2.0), &json!(2)), Ordering::Equal);
        assert_eq!(compare(&None, &Some(json!(null))), Ordering::Equal);
    }

    #[test]
    fn test_in() {
        let doc = json!({"_id": "b"});
        let expr = Expr::is_in(Expr::field("_id"), vec![json!("a"), json!("b")]);
        assert_eq!(eval(&expr, &doc), Some(json!(true)));
    }
}
