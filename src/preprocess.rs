use arcstr::ArcStr;

use crate::{
    lexer::normalize_ident,
    types::*,
    util::bmatch_caseless,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum EraPpDirective {
    #[strum(serialize = "SKIPSTART")]
    SkipStart,
    #[strum(serialize = "SKIPEND")]
    SkipEnd,
    #[strum(serialize = "IF")]
    If,
    #[strum(serialize = "ELSEIF")]
    ElseIf,
    #[strum(serialize = "ELSE")]
    Else,
    #[strum(serialize = "ENDIF")]
    EndIf,
    #[strum(serialize = "IF_DEBUG")]
    IfDebug,
    #[strum(serialize = "IF_NDEBUG")]
    IfNDebug,
}

impl EraPpDirective {
    fn from_keyword(keyword: &str) -> Option<Self> {
        bmatch_caseless!(keyword.as_bytes();
            b"SKIPSTART" => Some(Self::SkipStart),
            b"SKIPEND" => Some(Self::SkipEnd),
            b"IF" => Some(Self::If),
            b"ELSEIF" => Some(Self::ElseIf),
            b"ELSE" => Some(Self::Else),
            b"ENDIF" => Some(Self::EndIf),
            b"IF_DEBUG" => Some(Self::IfDebug),
            b"IF_NDEBUG" => Some(Self::IfNDebug),
            _ => None,
        )
    }

    fn takes_arg(self) -> bool {
        matches!(self, Self::If | Self::ElseIf)
    }
}

/// What the loader should do with a physical line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EraPpLine {
    /// The line was a directive and has been consumed.
    Directive,
    /// The line is inside a disabled region.
    Skipped,
    /// The line should be parsed.
    Active,
}

#[derive(Debug, Clone, Copy)]
struct EraPpFrame {
    enclosing_disabled: bool,
    branch_taken: bool,
    active: bool,
}

#[derive(Debug, Clone, Copy)]
struct EraPpCloser {
    closer: EraPpDirective,
    opener: EraPpDirective,
    loc: SrcLoc,
}

/// Load-time directive state machine, one instance per file.
#[derive(Debug)]
pub struct EraPreprocessor {
    is_debug: bool,
    ignore_case: bool,
    frames: Vec<EraPpFrame>,
    expected_closers: Vec<EraPpCloser>,
}

impl EraPreprocessor {
    pub fn new(is_debug: bool, ignore_case: bool) -> Self {
        EraPreprocessor {
            is_debug,
            ignore_case,
            frames: Vec::new(),
            expected_closers: Vec::new(),
        }
    }

    pub fn is_disabled(&self) -> bool {
        self.frames.last().is_some_and(|x| !x.active)
    }

    /// Classifies `line` (already stripped of comments and leading blanks),
    /// applying it when it is a directive.
    pub fn process_line(
        &mut self,
        line: &str,
        loc: SrcLoc,
        defines: &EraDefineScope,
        diag: &mut Diagnostic,
    ) -> EraPpLine {
        let Some(recognized) = self.recognize(line, loc, diag) else {
            return if self.is_disabled() {
                EraPpLine::Skipped
            } else {
                EraPpLine::Active
            };
        };
        // Unknown directives are dropped rather than parsed as code
        let Some((directive, arg)) = recognized else {
            return EraPpLine::Directive;
        };
        diag.set_category(EraDiagCategory::Preprocess);
        let ignore_case = self.ignore_case;
        let is_defined = |diag: &mut Diagnostic| match arg {
            Some(name) => defines.contains(&normalize_ident(name, ignore_case)),
            None => {
                diag.span_err(
                    ArcStr::new(),
                    loc,
                    format!("[{directive}] requires a macro name"),
                );
                false
            }
        };
        match directive {
            EraPpDirective::SkipStart => {
                self.push(directive, EraPpDirective::SkipEnd, false, loc);
            }
            EraPpDirective::If => {
                let cond = is_defined(diag);
                self.push(directive, EraPpDirective::EndIf, cond, loc);
            }
            EraPpDirective::IfDebug => {
                self.push(directive, EraPpDirective::EndIf, self.is_debug, loc);
            }
            EraPpDirective::IfNDebug => {
                self.push(directive, EraPpDirective::EndIf, !self.is_debug, loc);
            }
            EraPpDirective::ElseIf | EraPpDirective::Else => {
                if !self.expect_top(directive, EraPpDirective::EndIf, loc, diag) {
                    return EraPpLine::Directive;
                }
                let cond = if directive == EraPpDirective::Else {
                    true
                } else {
                    is_defined(diag)
                };
                if let Some(frame) = self.frames.last_mut() {
                    frame.active = !frame.enclosing_disabled && !frame.branch_taken && cond;
                    frame.branch_taken |= cond;
                }
            }
            EraPpDirective::EndIf | EraPpDirective::SkipEnd => {
                if self.expect_top(directive, directive, loc, diag) {
                    self.frames.pop();
                    self.expected_closers.pop();
                }
            }
        }
        EraPpLine::Directive
    }

    /// Reports directives still open at end of file, once for the whole file.
    pub fn finish(&mut self, diag: &mut Diagnostic) {
        if let Some(first) = self.expected_closers.first() {
            diag.set_category(EraDiagCategory::Preprocess).span_warn(
                ArcStr::new(),
                first.loc,
                format!(
                    "[{}] is not closed by [{}] before end of file ({} directive(s) left open)",
                    first.opener,
                    first.closer,
                    self.expected_closers.len()
                ),
            );
        }
        self.frames.clear();
        self.expected_closers.clear();
    }

    fn push(&mut self, opener: EraPpDirective, closer: EraPpDirective, cond: bool, loc: SrcLoc) {
        let enclosing_disabled = self.is_disabled();
        self.frames.push(EraPpFrame {
            enclosing_disabled,
            branch_taken: cond,
            active: !enclosing_disabled && cond,
        });
        self.expected_closers.push(EraPpCloser {
            closer,
            opener,
            loc,
        });
    }

    fn expect_top(
        &self,
        directive: EraPpDirective,
        closer: EraPpDirective,
        loc: SrcLoc,
        diag: &mut Diagnostic,
    ) -> bool {
        match self.expected_closers.last() {
            Some(top) if top.closer == closer => true,
            Some(top) => {
                diag.span_warn(
                    ArcStr::new(),
                    loc,
                    format!(
                        "[{directive}] does not match the open [{}]; expected [{}]",
                        top.opener, top.closer
                    ),
                );
                false
            }
            None => {
                diag.span_warn(
                    ArcStr::new(),
                    loc,
                    format!("[{directive}] without a matching opener"),
                );
                false
            }
        }
    }

    fn recognize<'l>(
        &self,
        line: &'l str,
        loc: SrcLoc,
        diag: &mut Diagnostic,
    ) -> Option<Option<(EraPpDirective, Option<&'l str>)>> {
        let inner = line.strip_prefix('[')?;
        let Some(end) = inner.find(']') else {
            if !self.is_disabled() {
                diag.set_category(EraDiagCategory::Preprocess).span_warn(
                    ArcStr::new(),
                    loc,
                    "unterminated `[` directive",
                );
            }
            return None;
        };
        let body = inner[..end].trim();
        let (keyword, arg) = match body.split_once(char::is_whitespace) {
            Some((k, a)) => (k, Some(a.trim()).filter(|x| !x.is_empty())),
            None => (body, None),
        };
        let Some(directive) = EraPpDirective::from_keyword(keyword) else {
            if !self.is_disabled() {
                diag.set_category(EraDiagCategory::Preprocess).span_warn(
                    ArcStr::new(),
                    loc,
                    format!("unknown directive [{keyword}]"),
                );
            }
            return Some(None);
        };
        if arg.is_some() && !directive.takes_arg() {
            diag.set_category(EraDiagCategory::Preprocess).span_warn(
                ArcStr::new(),
                loc,
                format!("[{directive}] takes no argument"),
            );
        }
        Some(Some((directive, arg)))
    }
}

#[cfg(test)]
mod tests {
    use indoc::indoc;

    use super::*;

    fn run(src: &str, is_debug: bool, defined: &[&str]) -> (Vec<String>, Diagnostic) {
        let mut defines = EraDefineScope::new();
        for name in defined {
            defines.insert(
                ArcStr::from(*name),
                EraDefineData {
                    filename: ArcStr::new(),
                    loc: SrcLoc::default(),
                    data: ArcStr::new(),
                },
            );
        }
        let mut pp = EraPreprocessor::new(is_debug, true);
        let mut diag = Diagnostic::with_file(arcstr::literal!("T.ERB"));
        let mut kept = Vec::new();
        for (i, line) in src.lines().enumerate() {
            let line = line.trim();
            let loc = SrcLoc::new(i as u32 + 1, 0);
            if pp.process_line(line, loc, &defines, &mut diag) == EraPpLine::Active {
                kept.push(line.to_owned());
            }
        }
        pp.finish(&mut diag);
        (kept, diag)
    }

    #[test]
    fn conditional_branches() {
        let src = indoc! {"
            a
            [IF FOO]
            b
            [ELSEIF BAR]
            c
            [ELSE]
            d
            [ENDIF]
            [SKIPSTART]
            e
            [IF BAR]
            f
            [ENDIF]
            [SKIPEND]
            [IF_DEBUG]
            g
            [ENDIF]
            [IF_NDEBUG]
            h
            [ENDIF]
        "};
        let (kept, diag) = run(src, false, &["BAR"]);
        assert_eq!(kept, vec!["a", "c", "h"]);
        assert!(diag.is_empty());

        let (kept, diag) = run(src, true, &["FOO", "BAR"]);
        assert_eq!(kept, vec!["a", "b", "g"]);
        assert!(diag.is_empty());
    }

    #[test]
    fn mismatch_warns_once_and_continues() {
        let src = indoc! {"
            [SKIPSTART]
            x
            [ENDIF]
            [SKIPEND]
            y
            [ELSE]
            z
        "};
        let (kept, diag) = run(src, false, &[]);
        assert_eq!(kept, vec!["y", "z"]);
        assert_eq!(diag.entries().len(), 2);
        assert!(diag
            .entries()
            .iter()
            .all(|x| x.level == DiagnosticLevel::Warning));
    }

    #[test]
    fn unterminated_is_warned_once() {
        let src = indoc! {"
            [IF FOO]
            [IF BAR]
            [SKIPSTART]
            x
        "};
        let (kept, diag) = run(src, false, &[]);
        assert!(kept.is_empty());
        assert_eq!(diag.entries().len(), 1);
        assert_eq!(diag.entries()[0].loc.line, 1);
    }
}
