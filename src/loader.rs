use arcstr::ArcStr;
use log::debug;

use crate::{
    expr::EraExprCtx,
    labels::EraLabelDirectory,
    line::{EraLine, EraLineId, EraLineKind, EraProgram},
    parser::{parse_label_line, parse_line, parse_sharp_line},
    preprocess::{EraPpLine, EraPreprocessor},
    types::*,
    util::strip_comment,
    vars::{EraLocalSizes, EraVarPool},
};

/// Per-file scanning state.
struct EraFileState {
    filename: ArcStr,
    /// The function currently receiving lines.
    func: Option<EraLineId>,
    /// Sharp lines are accepted only directly below the label.
    in_header: bool,
    /// Set after a malformed function label, until the next label.
    skipping: bool,
}

/// Splits script files into functions and lays them out in one program.
/// Header loading must have finished before the first file is loaded.
#[derive(Debug)]
pub struct EraScriptLoader {
    is_debug: bool,
    ignore_case: bool,
    program: EraProgram,
    labels: EraLabelDirectory,
    file_count: usize,
}

impl EraScriptLoader {
    pub fn new(is_debug: bool, ignore_case: bool) -> Self {
        EraScriptLoader {
            is_debug,
            ignore_case,
            program: EraProgram::new(),
            labels: EraLabelDirectory::new(),
            file_count: 0,
        }
    }

    pub fn program(&self) -> &EraProgram {
        &self.program
    }

    pub fn labels(&self) -> &EraLabelDirectory {
        &self.labels
    }

    pub fn load_file(
        &mut self,
        filename: ArcStr,
        src: &str,
        defines: &EraDefineScope,
        vars: &EraVarPool,
        diag: &mut Diagnostic,
    ) {
        let ctx = EraExprCtx::new(Some(defines), self.ignore_case);
        let lookup = |name: &str, idx: &[i64]| vars.get_const(name, idx);
        let mut pp = EraPreprocessor::new(self.is_debug, self.ignore_case);
        let mut state = EraFileState {
            filename,
            func: None,
            in_header: false,
            skipping: false,
        };
        let first_line = self.program.len();

        for (i, raw_line) in src.lines().enumerate() {
            let content = strip_comment(raw_line);
            let text = content.trim();
            if text.is_empty() {
                continue;
            }
            let col = (content.len() - content.trim_start().len()) as u32;
            let loc = SrcLoc::new(i as u32 + 1, col);
            if pp.process_line(text, loc, defines, diag) != EraPpLine::Active {
                continue;
            }

            if text.starts_with('@') {
                self.close_function(&mut state, diag);
                match parse_label_line(text, col, ctx, &lookup) {
                    EraLineKind::FunctionLabel(label) => {
                        if let Some(msg) = &label.error {
                            diag.set_category(EraDiagCategory::Label).span_err(
                                ArcStr::new(),
                                loc,
                                msg.clone(),
                            );
                        }
                        let id = self.program.next_id();
                        self.program.push(EraLine {
                            filename: state.filename.clone(),
                            loc,
                            func: id,
                            kind: EraLineKind::FunctionLabel(label),
                        });
                        state.func = Some(id);
                        state.in_header = true;
                        state.skipping = false;
                    }
                    EraLineKind::Invalid(msg) => {
                        diag.set_category(EraDiagCategory::Label).span_err(
                            ArcStr::new(),
                            loc,
                            format!("{msg}; lines up to the next function are skipped"),
                        );
                        state.skipping = true;
                    }
                    other => {
                        diag.set_category(EraDiagCategory::Label).span_err(
                            ArcStr::new(),
                            loc,
                            format!("unexpected line kind for a function label: {other:?}"),
                        );
                        state.skipping = true;
                    }
                }
                continue;
            }
            if state.skipping {
                continue;
            }
            let Some(func) = state.func else {
                diag.set_category(EraDiagCategory::Syntax).span_err(
                    ArcStr::new(),
                    loc,
                    "line does not belong to any function",
                );
                continue;
            };

            if let Some(sharp) = text.strip_prefix('#') {
                if !state.in_header {
                    diag.set_category(EraDiagCategory::Label).span_warn(
                        ArcStr::new(),
                        loc,
                        "`#` declarations must directly follow the function label; ignored",
                    );
                    continue;
                }
                if let Some(label) = self.program.func_mut(func) {
                    parse_sharp_line(label, sharp, loc, &state.filename, ctx, &lookup, diag);
                }
                continue;
            }
            state.in_header = false;

            let kind = if text.starts_with('$') {
                parse_label_line(text, col, ctx, &lookup)
            } else {
                parse_line(text, loc, ctx, diag)
            };
            if let EraLineKind::Invalid(msg) = &kind {
                diag.set_category(EraDiagCategory::Syntax)
                    .span_err(ArcStr::new(), loc, msg.clone());
            }
            let goto_name = match &kind {
                EraLineKind::GotoLabel(name) => Some(name.clone()),
                _ => None,
            };
            let id = self.program.push(EraLine {
                filename: state.filename.clone(),
                loc,
                func,
                kind,
            });
            if let Some(name) = goto_name {
                if let Err(e) = self.labels.add_goto(func, &name, id) {
                    diag.set_category(EraDiagCategory::Label)
                        .span_err(ArcStr::new(), loc, e.clone());
                    self.program.set_error(id, e);
                }
            }
        }

        self.close_function(&mut state, diag);
        pp.finish(diag);
        self.file_count += 1;
        debug!(
            "loaded script `{}`: {} line(s)",
            state.filename,
            self.program.len() - first_line
        );
    }

    /// Terminates the open function with a `Null` line and registers it.
    fn close_function(&mut self, state: &mut EraFileState, diag: &mut Diagnostic) {
        let Some(func) = state.func.take() else {
            return;
        };
        let loc = self.program.get(func).map_or_else(SrcLoc::default, |x| x.loc);
        let end = self.program.push(EraLine {
            filename: state.filename.clone(),
            loc,
            func,
            kind: EraLineKind::Null,
        });
        let Some(label) = self.program.func_mut(func) else {
            return;
        };
        label.end = end;
        if label.error.is_some() {
            return;
        }
        let (name, flags) = (label.name.clone(), label.flags);
        if let Err(e) = self.labels.add_function(&name, func, flags) {
            diag.set_category(EraDiagCategory::Label)
                .span_err(ArcStr::new(), loc, e.clone());
            self.program.set_error(func, e);
        }
    }

    /// Allocates per-function storage and returns the finished program.
    pub fn finish(
        self,
        vars: &mut EraVarPool,
        default_sizes: EraLocalSizes,
        diag: &mut Diagnostic,
    ) -> (EraProgram, EraLabelDirectory) {
        let EraScriptLoader {
            mut program,
            labels,
            file_count,
            ..
        } = self;
        let ids: Vec<_> = program.function_ids().collect();
        for &id in &ids {
            let Some(label) = program.func(id) else {
                continue;
            };
            let sizes = EraLocalSizes {
                local: label.local_size.unwrap_or(default_sizes.local),
                locals: label.locals_size.unwrap_or(default_sizes.locals),
                ..default_sizes
            };
            let decls = label.private_decls.clone();
            let func_vars = vars.add_func(id, sizes);
            for decl in decls {
                let (filename, loc) = (decl.filename.clone(), decl.loc);
                if let Err(e) = func_vars.declare(decl) {
                    diag.set_category(EraDiagCategory::Label)
                        .span_err(filename, loc, e.clone());
                    program.set_error(id, e);
                }
            }
        }
        debug!(
            "script loading finished: {file_count} file(s), {} function(s), {} event(s)",
            labels.func_count(),
            labels.event_count()
        );
        (program, labels)
    }
}

#[cfg(test)]
mod tests {
    use indoc::indoc;

    use super::*;
    use crate::commands::EraCmd;

    fn sizes() -> EraLocalSizes {
        EraLocalSizes {
            local: 10,
            locals: 10,
            arg: 10,
            args: 10,
        }
    }

    fn load(files: &[(&str, &str)]) -> (EraProgram, EraLabelDirectory, Diagnostic) {
        let defines = EraDefineScope::new();
        let mut vars = EraVarPool::new();
        let mut loader = EraScriptLoader::new(false, true);
        let mut diag = Diagnostic::new();
        for (name, src) in files {
            loader.load_file(ArcStr::from(*name), src, &defines, &vars, &mut diag);
        }
        let (program, labels) = loader.finish(&mut vars, sizes(), &mut diag);
        (program, labels, diag)
    }

    #[test]
    fn functions_are_laid_out_with_end_lines() {
        let (program, labels, diag) = load(&[(
            "A.ERB",
            indoc! {r#"
                @MAIN
                #LOCALSIZE 3
                    PRINTL start ; comment
                $AGAIN
                    GOTO AGAIN
                @SUB(X)
                    RETURN X
            "#},
        )]);
        assert!(diag.is_empty(), "{:?}", diag.entries());
        let main = labels.get_func("MAIN").expect("registered");
        let label = program.func(main).expect("label");
        assert_eq!(label.local_size, Some(3));
        let body: Vec<_> = program.body_of(main).collect();
        assert_eq!(body.len(), 3);
        assert_eq!(program.get(body[0]).and_then(|x| x.cmd()), Some(EraCmd::PrintL));
        assert_eq!(labels.get_goto(main, "AGAIN"), Some(body[1]));
        assert!(matches!(program.get(label.end).map(|x| &x.kind), Some(EraLineKind::Null)));
        assert_eq!(labels.get_func("SUB"), Some(label.end.next()));
    }

    #[test]
    fn misplaced_lines_are_reported() {
        let (program, labels, diag) = load(&[
            (
                "A.ERB",
                indoc! {"
                    PRINTL orphan
                    @1BAD
                        PRINTL skipped
                    @F
                        PRINTL body
                    #LOCALSIZE 3
                    $X
                    $X
                "},
            ),
            ("B.ERB", "@F\n"),
        ]);
        let levels: Vec<_> = diag.entries().iter().map(|x| x.level).collect();
        assert_eq!(
            levels,
            [
                DiagnosticLevel::Error,
                DiagnosticLevel::Error,
                DiagnosticLevel::Warning,
                DiagnosticLevel::Error,
                DiagnosticLevel::Error,
            ]
        );
        let first = labels.get_func("F").expect("first definition wins");
        assert_eq!(program.get(first).map(|x| x.filename.as_str()), Some("A.ERB"));
        let dup = program
            .function_ids()
            .find(|&x| x != first)
            .expect("second definition kept in the program");
        assert!(program.func(dup).is_some_and(|x| x.error.is_some()));
    }

    #[test]
    fn events_collect_every_contribution() {
        let (_, labels, diag) = load(&[
            ("A.ERB", "@EVENTTRAIN\n#LATER\nPRINTL a\n"),
            ("B.ERB", "@EVENTTRAIN\n#PRI\nPRINTL b\n"),
            ("C.ERB", "@EVENTTRAIN\nPRINTL c\n"),
        ]);
        assert!(diag.is_empty());
        let groups = labels.get_event("EVENTTRAIN").expect("event");
        assert_eq!(groups.all().count(), 3);
        assert_eq!(groups.group(crate::labels::EVENT_GROUP_PRI).len(), 1);
    }
}
