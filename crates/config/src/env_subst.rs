/// Expand `${VAR}` and `${VAR:-fallback}` placeholders.
///
/// Unset variables without a fallback are left verbatim so the parse error
/// points at the placeholder rather than at an empty value.
pub fn substitute_env(input: &str) -> String {
    substitute_with(input, |name| std::env::var(name).ok())
}

/// Same as [`substitute_env`] with a caller-supplied lookup.
pub fn substitute_with(input: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            // Unterminated, emit the remainder untouched.
            out.push_str(&rest[start..]);
            return out;
        };

        let expr = &after[..end];
        let (name, fallback) = match expr.split_once(":-") {
            Some((name, fallback)) => (name, Some(fallback)),
            None => (expr, None),
        };

        match (lookup(name).filter(|v| !v.is_empty()), fallback) {
            (Some(value), _) => out.push_str(&value),
            (None, Some(fallback)) => out.push_str(fallback),
            (None, None) => {
                out.push_str("${");
                out.push_str(expr);
                out.push('}');
            },
        }
        rest = &after[end + 1..];
    }

    out.push_str(rest);
    out
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn lookup(name: &str) -> Option<String> {
        match name {
            "NACHOS_DB" => Some("/var/lib/nachos.db".into()),
            "EMPTY" => Some(String::new()),
            _ => None,
        }
    }

    #[test]
    fn substitutes_known_var() {
        assert_eq!(
            substitute_with("path = \"${NACHOS_DB}\"", lookup),
            "path = \"/var/lib/nachos.db\""
        );
    }

    #[test]
    fn uses_fallback_for_unset_or_empty() {
        assert_eq!(substitute_with("${MISSING:-info}", lookup), "info");
        assert_eq!(substitute_with("${EMPTY:-x}", lookup), "x");
    }

    #[test]
    fn leaves_unknown_var() {
        assert_eq!(substitute_with("${NACHOS_NOPE}", lookup), "${NACHOS_NOPE}");
    }

    #[test]
    fn unterminated_placeholder_is_literal() {
        assert_eq!(substitute_with("a ${B", lookup), "a ${B");
    }

    #[test]
    fn no_placeholders() {
        assert_eq!(substitute_env("plain text"), "plain text");
    }
}
