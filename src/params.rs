//! Request parameter tokenizer.
//!
//! Grounded on `get_params_token`/`get_params_option` in `util.c`: the
//! portion of a request line after the command word is a space-separated
//! list of tokens, each either a bare word or a `"`-quoted run (so a `file`
//! path may contain spaces). This module re-implements that tokenizer over
//! `&str` plus the two lookup helpers commands use: a bare flag
//! (`get_params_option(..., is_parametric = FALSE, ...)`) and a
//! name-then-value pair (`is_parametric = TRUE`).

/// Split a parameter string into tokens, honoring `"`-quoted runs.
///
/// Mirrors `get_params_token`'s divider rule: a token starting with `"` ends
/// at the next `"`; any other token ends at the next space. Leading spaces
/// before each token are skipped.
pub fn tokenize(params: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut chars = params.chars().peekable();

    while chars.peek().is_some() {
        while chars.peek() == Some(&' ') {
            chars.next();
        }
        let Some(&first) = chars.peek() else { break };

        let mut token = String::new();
        if first == '"' {
            chars.next();
            for c in chars.by_ref() {
                if c == '"' {
                    break;
                }
                token.push(c);
            }
        } else {
            while let Some(&c) = chars.peek() {
                if c == ' ' {
                    break;
                }
                token.push(c);
                chars.next();
            }
        }
        tokens.push(token);
    }

    tokens
}

/// `get_params_option(params, name, is_parametric = FALSE, ...)`: true if
/// `name` appears as a bare token.
pub fn has_flag(params: &str, name: &str) -> bool {
    tokenize(params).iter().any(|t| t == name)
}

/// `get_params_option(params, name, is_parametric = TRUE, ...)`: the token
/// immediately following `name`, or `None` if `name` does not appear or has
/// no following token.
pub fn get_value<'a>(tokens: &'a [String], name: &str) -> Option<&'a str> {
    tokens
        .iter()
        .position(|t| t == name)
        .and_then(|i| tokens.get(i + 1))
        .map(|s| s.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenizes_a_quoted_path_with_spaces() {
        let tokens = tokenize(r#"file "C:\Program Files\a.dll" process_relocs"#);
        assert_eq!(tokens, vec!["file", r"C:\Program Files\a.dll", "process_relocs"]);
    }

    #[test]
    fn has_flag_finds_bare_tokens() {
        assert!(has_flag("file \"x\" use_stats", "use_stats"));
        assert!(!has_flag("file \"x\"", "use_stats"));
    }

    #[test]
    fn get_value_reads_the_following_token() {
        let tokens = tokenize("file \"x.dll\" custom_image_base 65536");
        assert_eq!(get_value(&tokens, "custom_image_base"), Some("65536"));
        assert_eq!(get_value(&tokens, "file"), Some("x.dll"));
        assert_eq!(get_value(&tokens, "missing"), None);
    }

    #[test]
    fn empty_params_tokenize_to_nothing() {
        assert!(tokenize("").is_empty());
        assert!(tokenize("   ").is_empty());
    }
}
