/// Splits text into lines, dropping empty ones.
///
/// `kubectl` and `helm` output is parsed line-by-line; trailing newlines and
/// blank separator lines carry no information.
pub fn split_lines(text: &str) -> Vec<&str> {
    text.lines().filter(|line| !line.trim().is_empty()).collect()
}

/// Splits a line at the given delimiter, dropping empty tokens.
///
/// Used for the whitespace-column output of `kubectl` and the tab-separated
/// output of `helm list`.
pub fn split_columns(line: &str, delim: char) -> Vec<&str> {
    line.split(delim)
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .collect()
}

/// Reverses the escaping applied to kubeconfig text in transit.
///
/// Clients send kubeconfigs as JSON strings with `\n`, `\t`, `\"`, and `\\`
/// escaped a second time; this restores the original YAML.
pub fn unescape(text: &str) -> String {
    let mut result = String::with_capacity(text.len());
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            result.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => result.push('\n'),
            Some('t') => result.push('\t'),
            Some('r') => result.push('\r'),
            Some('"') => result.push('"'),
            Some('\\') => result.push('\\'),
            Some(other) => {
                result.push('\\');
                result.push(other);
            }
            None => result.push('\\'),
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_lines_drops_blanks() {
        let lines = split_lines("first\n\nsecond\n   \nthird\n");
        assert_eq!(lines, vec!["first", "second", "third"]);
    }

    #[test]
    fn split_columns_collapses_repeated_delimiters() {
        let columns = split_columns("tiller-deploy-abc   1/1   Running", ' ');
        assert_eq!(columns, vec!["tiller-deploy-abc", "1/1", "Running"]);
    }

    #[test]
    fn split_columns_handles_tabs() {
        let columns = split_columns("release\t1\tdeployed", '\t');
        assert_eq!(columns, vec!["release", "1", "deployed"]);
    }

    #[test]
    fn unescape_restores_newlines_and_quotes() {
        assert_eq!(unescape("a\\nb\\t\\\"c\\\""), "a\nb\t\"c\"");
        assert_eq!(unescape("plain text"), "plain text");
        assert_eq!(unescape("double\\\\slash"), "double\\slash");
    }
}
