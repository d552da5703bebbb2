//! Condition expressions gating cases and template items
//!
//! ```text
//! expr    := and ( "or" and )*
//! and     := unary ( "and" unary )*
//! unary   := "not" unary | compare
//! compare := operand ( "==" | "!=" | ">=" | "<=" | ">" | "<" ) operand | literal
//! literal := true | false | 1 | 0
//! ```
//!
//! The expression is split into terms and operands before variables are
//! substituted, and keywords or comparators inside quotes are plain text, so
//! a bound value never changes the structure. Comparisons are numeric when
//! both sides parse as numbers and string comparisons otherwise, with
//! surrounding quotes stripped.

use kwrun_common::{Error, Result};
use std::cmp::Ordering;

use crate::vars::{substitute, Bindings};

const COMPARATORS: [&str; 6] = ["==", "!=", ">=", "<=", ">", "<"];

/// Evaluate `expression` with its variables bound from `vars`
pub fn evaluate<B: Bindings + ?Sized>(expression: &str, vars: &B) -> Result<bool> {
    let invalid = |reason: String| Error::InvalidCondition {
        expression: expression.to_string(),
        reason,
    };

    let mut any = false;
    for branch in split_keyword(expression, "or") {
        let mut all = true;
        for term in split_keyword(branch, "and") {
            // evaluate every term so malformed input is always reported
            all &= eval_unary(term, vars)?.map_err(invalid)?;
        }
        any |= all;
    }
    Ok(any)
}

/// Outer errors come from substitution, inner ones from malformed syntax
fn eval_unary<B: Bindings + ?Sized>(
    term: &str,
    vars: &B,
) -> Result<std::result::Result<bool, String>> {
    let term = term.trim();
    if let Some(rest) = term.strip_prefix("not ") {
        return Ok(eval_unary(rest, vars)?.map(|v| !v));
    }
    if term.is_empty() {
        return Ok(Err("empty expression".to_string()));
    }

    let split = COMPARATORS
        .iter()
        .find_map(|op| find_unquoted(term, op).map(|idx| (idx, *op)));
    if let Some((idx, op)) = split {
        let lhs = substitute(&term[..idx], vars)?;
        let rhs = substitute(&term[idx + op.len()..], vars)?;
        return Ok(Ok(compare(unquote(&lhs), op, unquote(&rhs))));
    }

    let literal = substitute(term, vars)?;
    Ok(match literal.trim().to_ascii_lowercase().as_str() {
        "true" | "1" => Ok(true),
        "false" | "0" => Ok(false),
        other => Err(format!("cannot interpret '{}' as a boolean", other)),
    })
}

fn compare(lhs: &str, op: &str, rhs: &str) -> bool {
    let ordering = match (lhs.parse::<f64>(), rhs.parse::<f64>()) {
        (Ok(a), Ok(b)) => a.partial_cmp(&b),
        _ => Some(lhs.cmp(rhs)),
    };
    let Some(ordering) = ordering else {
        return op == "!=";
    };
    match op {
        "==" => ordering == Ordering::Equal,
        "!=" => ordering != Ordering::Equal,
        ">=" => ordering != Ordering::Less,
        "<=" => ordering != Ordering::Greater,
        ">" => ordering == Ordering::Greater,
        _ => ordering == Ordering::Less,
    }
}

fn unquote(raw: &str) -> &str {
    let raw = raw.trim();
    for quote in ['"', '\''] {
        if raw.len() >= 2 && raw.starts_with(quote) && raw.ends_with(quote) {
            return &raw[1..raw.len() - 1];
        }
    }
    raw
}

/// Byte offset of the first `needle` outside single or double quotes
fn find_unquoted(text: &str, needle: &str) -> Option<usize> {
    let mut quote: Option<char> = None;
    for (idx, ch) in text.char_indices() {
        match quote {
            Some(open) if ch == open => quote = None,
            Some(_) => {}
            None if ch == '"' || ch == '\'' => quote = Some(ch),
            None if text[idx..].starts_with(needle) => return Some(idx),
            None => {}
        }
    }
    None
}

/// Split on a whitespace-delimited keyword outside quotes
fn split_keyword<'a>(text: &'a str, keyword: &str) -> Vec<&'a str> {
    let needle = format!(" {} ", keyword);
    let mut parts = Vec::new();
    let mut rest = text;
    while let Some(idx) = find_unquoted(rest, &needle) {
        parts.push(&rest[..idx]);
        rest = &rest[idx + needle.len()..];
    }
    parts.push(rest);
    parts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vars::Vars;
    use serde_json::json;
    use test_case::test_case;

    fn vars() -> Vars {
        let mut vars = Vars::new();
        vars.insert("env".into(), json!("prod"));
        vars.insert("retries".into(), json!(3));
        vars.insert("enabled".into(), json!(true));
        vars.insert("title".into(), json!("rock and roll"));
        vars.insert("ratio".into(), json!("a>=b"));
        vars
    }

    #[test_case("true" => true; "literal true")]
    #[test_case("FALSE" => false; "literal false any case")]
    #[test_case("1" => true; "literal one")]
    #[test_case("0" => false; "literal zero")]
    #[test_case("not false" => true; "negation")]
    #[test_case("${enabled}" => true; "bool variable")]
    #[test_case("${env} == prod" => true; "string equality")]
    #[test_case("'${env}' == \"prod\"" => true; "quotes stripped")]
    #[test_case("${env} != prod" => false; "string inequality")]
    #[test_case("${retries} > 2" => true; "greater than")]
    #[test_case("${retries} >= 3.0" => true; "greater equal mixed numbers")]
    #[test_case("${retries} < 10" => true; "less than")]
    #[test_case("10 > 9" => true; "numeric not lexicographic")]
    #[test_case("${env} == dev or ${retries} <= 3" => true; "or branch")]
    #[test_case("${env} == prod and not ${enabled}" => false; "and with not")]
    #[test_case("${title} == 'rock and roll'" => true; "keyword inside quotes")]
    #[test_case("'${title}' != 'punk or metal'" => true; "or inside quotes")]
    #[test_case("${ratio} == 'a>=b'" => true; "comparator inside quotes")]
    fn test_evaluate(expr: &str) -> bool {
        evaluate(expr, &vars()).unwrap()
    }

    #[test]
    fn test_missing_variable_propagates() {
        let err = evaluate("${nope} == 1", &vars()).unwrap_err();
        assert!(matches!(err, Error::MissingVariable { .. }));
    }

    #[test]
    fn test_unparseable() {
        let err = evaluate("maybe", &vars()).unwrap_err();
        assert!(matches!(err, Error::InvalidCondition { .. }));
        assert!(evaluate("true and ", &vars()).is_err());
    }
}
