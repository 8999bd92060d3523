//! Script statement splitting

/// One executable line of a calculation script
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Statement<'a> {
    /// 1-based source line number
    pub line: usize,
    /// Trimmed statement text
    pub text: &'a str,
}

/// Iterate the statements of a script
///
/// Blank lines and lines whose first non-space character is `#` are
/// skipped, but still count towards line numbers.
pub fn statements(script: &str) -> impl Iterator<Item = Statement<'_>> {
    script.lines().enumerate().filter_map(|(i, line)| {
        let text = line.trim();
        if text.is_empty() || text.starts_with('#') {
            None
        } else {
            Some(Statement { line: i + 1, text })
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_skips_blank_and_comment_lines() {
        let script = "# header\n\n  x = 1  \r\n   # indented comment\n{d[0][0]} = x\n";
        let found: Vec<Statement> = statements(script).collect();

        assert_eq!(
            found,
            vec![
                Statement {
                    line: 3,
                    text: "x = 1"
                },
                Statement {
                    line: 5,
                    text: "{d[0][0]} = x"
                },
            ]
        );
    }

    #[test]
    fn test_empty_script() {
        assert_eq!(statements("").count(), 0);
        assert_eq!(statements("\n \n# only comments\n").count(), 0);
    }
}
