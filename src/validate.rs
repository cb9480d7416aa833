use std::collections::VecDeque;

use arcstr::ArcStr;
use log::debug;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::{
    commands::{EraCallKind, EraCallTarget, EraCaseItem, EraCmd, EraCmdArg},
    expr::{EraBinaryOp, EraExpr, EraExprCtx, EraUnaryOp, EraVarRef},
    interpret::is_builtin_method,
    labels::EraLabelDirectory,
    line::{EraFuncFlags, EraLineId, EraProgram, DEPTH_UNREACHED},
    parser::materialize_arg,
    types::*,
    vars::EraVarPool,
};

/// How functions that nothing calls by name are reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum EraUnreferencedPolicy {
    Ignore,
    /// Only the first report of every file is shown.
    OncePerFile,
    #[default]
    Display,
    /// Reports are held back and emitted after loading completes.
    Deferred,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct EraValidateOptions {
    /// Materialize every argument up front instead of per validated function.
    pub eager_arg_parse: bool,
    /// Validate every function regardless of reachability.
    pub analysis_mode: bool,
    pub compat_call_event_as_function: bool,
    pub unreferenced_policy: EraUnreferencedPolicy,
}

#[derive(Debug, Default)]
pub struct EraValidateSummary {
    pub has_indirect_call: bool,
    pub validated: usize,
    pub unreferenced: usize,
    /// Held-back reports under [`EraUnreferencedPolicy::Deferred`].
    pub deferred: Option<Diagnostic>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EraNestKind {
    If,
    SelectCase,
    Loop(EraCmd),
    Data,
    DataList,
    TryList,
    NoSkip,
    TryCatch,
    Catch,
}

impl EraNestKind {
    fn closer(self) -> &'static str {
        match self {
            EraNestKind::If => "ENDIF",
            EraNestKind::SelectCase => "ENDSELECT",
            EraNestKind::Loop(cmd) => cmd.loop_closer().map_or("a loop end", |x| x.name()),
            EraNestKind::Data => "ENDDATA",
            EraNestKind::DataList => "ENDLIST",
            EraNestKind::TryList => "ENDFUNC",
            EraNestKind::NoSkip => "ENDNOSKIP",
            EraNestKind::TryCatch => "CATCH",
            EraNestKind::Catch => "ENDCATCH",
        }
    }
}

/// An open construct during the nesting walk.
#[derive(Debug)]
struct EraNestFrame {
    kind: EraNestKind,
    opener: EraLineId,
    branches: SmallVec<[EraLineId; 2]>,
    /// `ELSE` or `CASEELSE` was seen.
    has_default: bool,
}

impl EraNestFrame {
    fn new(kind: EraNestKind, opener: EraLineId) -> Self {
        EraNestFrame {
            kind,
            opener,
            branches: SmallVec::new(),
            has_default: false,
        }
    }
}

/// Static validation of loaded functions. Every function runs through
/// argument materialization, nesting validation and target resolution, in
/// that order, at most once.
pub struct EraValidator<'a> {
    program: &'a mut EraProgram,
    labels: &'a EraLabelDirectory,
    vars: &'a EraVarPool,
    ctx: EraExprCtx<'a>,
    opts: EraValidateOptions,
    has_indirect_call: bool,
}

impl<'a> EraValidator<'a> {
    pub fn new(
        program: &'a mut EraProgram,
        labels: &'a EraLabelDirectory,
        vars: &'a EraVarPool,
        ctx: EraExprCtx<'a>,
        opts: EraValidateOptions,
    ) -> Self {
        EraValidator {
            program,
            labels,
            vars,
            ctx,
            opts,
            has_indirect_call: false,
        }
    }

    /// Validates every function reachable from system, event and method
    /// functions, in breadth-first dependency order, then reports or
    /// force-validates the rest.
    pub fn validate_all(&mut self, diag: &mut Diagnostic) -> EraValidateSummary {
        let funcs: Vec<EraLineId> = self.program.function_ids().collect();
        if self.opts.eager_arg_parse {
            for &func in &funcs {
                self.materialize(func, diag);
            }
        }

        let roots = EraFuncFlags::IS_EVENT | EraFuncFlags::IS_SYSTEM | EraFuncFlags::IS_METHOD;
        let mut queue = VecDeque::new();
        for &func in &funcs {
            if let Some(label) = self.program.func_mut(func) {
                if label.flags.intersects(roots) {
                    label.depth = 0;
                    queue.push_back(func);
                }
            }
        }
        let mut summary = EraValidateSummary::default();
        while let Some(func) = queue.pop_front() {
            let depth = self.program.func(func).map_or(0, |x| x.depth);
            for target in self.validate_function(func, diag) {
                let Some(label) = self.program.func_mut(target) else {
                    continue;
                };
                if label.depth == DEPTH_UNREACHED {
                    label.depth = depth + 1;
                    queue.push_back(target);
                }
            }
            summary.validated += 1;
        }

        let leftover: Vec<_> = funcs
            .iter()
            .copied()
            .filter(|&x| self.program.func(x).is_some_and(|x| !x.checked))
            .collect();
        if self.opts.analysis_mode || self.has_indirect_call {
            for &func in &leftover {
                self.validate_function(func, diag);
                summary.validated += 1;
            }
        } else {
            summary.unreferenced = self.report_unreferenced(&leftover, diag, &mut summary.deferred);
        }
        summary.has_indirect_call = self.has_indirect_call;
        debug!(
            "validated {} function(s); {} unreferenced; indirect calls: {}",
            summary.validated, summary.unreferenced, summary.has_indirect_call
        );
        summary
    }

    /// Runs all three passes over `func` unless it was validated before.
    /// Returns the functions it calls by name.
    pub fn validate_function(&mut self, func: EraLineId, diag: &mut Diagnostic) -> Vec<EraLineId> {
        let Some(label) = self.program.func_mut(func) else {
            return Vec::new();
        };
        if label.checked {
            return Vec::new();
        }
        label.checked = true;
        debug!("validating @{} (depth {})", label.name, label.depth);
        self.materialize(func, diag);
        self.check_nesting(func, diag);
        let mut reached = Vec::new();
        self.resolve_targets(func, diag, &mut reached);
        reached
    }

    pub fn has_indirect_call(&self) -> bool {
        self.has_indirect_call
    }

    fn report_unreferenced(
        &mut self,
        funcs: &[EraLineId],
        diag: &mut Diagnostic,
        deferred: &mut Option<Diagnostic>,
    ) -> usize {
        let mut count = 0;
        let mut seen_files = FxHashSet::default();
        for &func in funcs {
            let (Some(line), Some(label)) = (self.program.get(func), self.program.func(func)) else {
                continue;
            };
            if label.is_event() || label.error.is_some() {
                continue;
            }
            count += 1;
            let msg = format!("function `{}` is never called", label.name);
            let (filename, loc) = (line.filename.clone(), line.loc);
            match self.opts.unreferenced_policy {
                EraUnreferencedPolicy::Ignore => (),
                EraUnreferencedPolicy::Display => {
                    diag.set_category(EraDiagCategory::Unreferenced)
                        .span_warn(filename, loc, msg);
                }
                EraUnreferencedPolicy::OncePerFile => {
                    if seen_files.insert(filename.clone()) {
                        diag.set_category(EraDiagCategory::Unreferenced).span_warn(
                            filename,
                            loc,
                            format!("{msg} (further reports in this file are suppressed)"),
                        );
                    }
                }
                EraUnreferencedPolicy::Deferred => {
                    deferred
                        .get_or_insert_with(|| {
                            Diagnostic::new().with_category(EraDiagCategory::Unreferenced)
                        })
                        .span_warn(filename, loc, msg);
                }
            }
        }
        count
    }

    fn line_error(
        &mut self,
        id: EraLineId,
        category: EraDiagCategory,
        loc: Option<SrcLoc>,
        msg: String,
        diag: &mut Diagnostic,
    ) {
        if let Some(line) = self.program.get(id) {
            diag.set_category(category).span_err(
                line.filename.clone(),
                loc.unwrap_or(line.loc),
                msg.clone(),
            );
        }
        self.program.set_error(id, msg);
    }

    fn line_warn(&self, id: EraLineId, category: EraDiagCategory, msg: String, diag: &mut Diagnostic) {
        if let Some(line) = self.program.get(id) {
            diag.set_category(category)
                .span_warn(line.filename.clone(), line.loc, msg);
        }
    }

    fn cmd_of(&self, id: EraLineId) -> Option<EraCmd> {
        self.program.get(id).and_then(|x| x.cmd())
    }

    fn link(&mut self, from: EraLineId, to: EraLineId) {
        if let Some(inst) = self.program.inst_mut(from) {
            inst.jump_to = Some(to);
        }
    }

    // ----- Pass 1: argument materialization -----

    fn materialize(&mut self, func: EraLineId, diag: &mut Diagnostic) {
        self.check_params(func, diag);
        let Some(label) = self.program.func(func) else {
            return;
        };
        let is_method = label.is_method();
        let vars = self.vars;
        let kind_of = |name: &str| vars.kind_of(Some(func), name);
        let body: Vec<_> = self.program.body_of(func).collect();
        for id in body {
            let Some(inst) = self.program.inst(id) else {
                continue;
            };
            if inst.arg.is_some() || inst.error.is_some() {
                continue;
            }
            let cmd = inst.cmd;
            if is_method && !cmd.is_method_safe() {
                let msg = format!("{cmd} cannot be used inside a #FUNCTION");
                self.line_error(id, EraDiagCategory::Argument, None, msg, diag);
                continue;
            }
            if !is_method && cmd == EraCmd::ReturnF {
                let msg = "RETURNF can only be used inside a #FUNCTION".to_owned();
                self.line_error(id, EraDiagCategory::Argument, None, msg, diag);
                continue;
            }
            match materialize_arg(inst, self.ctx, &kind_of) {
                Ok(arg) => {
                    if let Some(msg) = self.check_arg_vars(func, &arg) {
                        self.line_error(id, EraDiagCategory::Argument, None, msg, diag);
                    } else if let Some(inst) = self.program.inst_mut(id) {
                        inst.arg = Some(arg);
                    }
                }
                Err(e) => {
                    let loc = self.program.get(id).map(|x| SrcLoc::new(x.loc.line, e.span.start().0));
                    self.line_error(id, EraDiagCategory::Syntax, loc, e.msg, diag);
                }
            }
        }
    }

    /// Reports the first undefined variable, or a write to a constant.
    fn check_arg_vars(&self, func: EraLineId, arg: &EraCmdArg) -> Option<String> {
        let mut undefined = None;
        let mut check = |var: &EraVarRef| {
            if undefined.is_none() && !self.vars.is_known(Some(func), &var.name) {
                undefined = Some(format!("undefined variable `{}`", var.name));
            }
        };
        arg.walk_exprs(&mut |expr| {
            if let EraExpr::Var(var) = expr {
                check(var);
            }
        });
        for var in arg.target_vars() {
            check(var);
        }
        if undefined.is_some() {
            return undefined;
        }
        for var in arg.target_vars() {
            let decl = self
                .vars
                .func(func)
                .and_then(|x| x.decl(&var.name))
                .or_else(|| self.vars.global_decl(&var.name));
            if decl.is_some_and(|x| x.is_const()) {
                return Some(format!("cannot assign to constant `{}`", var.name));
            }
        }
        None
    }

    fn check_params(&mut self, func: EraLineId, diag: &mut Diagnostic) {
        let Some(label) = self.program.func(func) else {
            return;
        };
        if label.error.is_some() {
            return;
        }
        let func_vars = self.vars.func(func);
        let mut error = None;
        for (param, default) in label.params.iter().zip(&label.defaults) {
            let Some(kind) = self.vars.kind_of(Some(func), &param.name) else {
                error = Some(format!("undefined parameter variable `{}`", param.name));
                break;
            };
            if param.indices.iter().any(|x| !matches!(x, EraExpr::Int(..))) {
                error = Some(format!("indices of parameter `{}` must be constants", param.name));
                break;
            }
            let is_ref = func_vars
                .and_then(|x| x.decl(&param.name))
                .is_some_and(|x| x.is_ref());
            match default {
                Some(_) if is_ref => {
                    error = Some(format!("REF parameter `{}` cannot have a default", param.name));
                    break;
                }
                Some(value) if value.kind() != kind => {
                    error = Some(format!(
                        "default of `{}` is {}, expected {kind}",
                        param.name,
                        value.kind()
                    ));
                    break;
                }
                _ => (),
            }
        }
        if let Some(msg) = error {
            self.line_error(func, EraDiagCategory::Label, None, msg, diag);
        }
    }

    // ----- Pass 2: nesting -----

    fn check_nesting(&mut self, func: EraLineId, diag: &mut Diagnostic) {
        use EraCmd::*;

        let mut stack: Vec<EraNestFrame> = Vec::new();
        let body: Vec<_> = self.program.body_of(func).collect();
        for id in body {
            let Some(cmd) = self.cmd_of(id) else {
                continue;
            };
            let restricted = match stack.last().map(|x| x.kind) {
                Some(EraNestKind::Data) => !matches!(cmd, Data | DataForm | DataList | EndData),
                Some(EraNestKind::DataList) => !matches!(cmd, Data | DataForm | EndList),
                Some(EraNestKind::TryList) => !matches!(cmd, Func | EndFunc),
                _ => false,
            };
            if restricted {
                let opener = stack
                    .last()
                    .and_then(|x| self.cmd_of(x.opener))
                    .map_or("", |x| x.name());
                let msg = format!("{cmd} is not allowed inside {opener}");
                self.line_error(id, EraDiagCategory::Nesting, None, msg, diag);
                continue;
            }
            let top = stack.last().map(|x| x.kind);
            match cmd {
                If => stack.push(EraNestFrame::new(EraNestKind::If, id)),
                ElseIf | Else => match stack.last_mut() {
                    Some(frame) if frame.kind == EraNestKind::If => {
                        if frame.has_default {
                            let msg = format!("{cmd} after ELSE");
                            self.line_error(id, EraDiagCategory::Nesting, None, msg, diag);
                            continue;
                        }
                        frame.has_default |= cmd == Else;
                        frame.branches.push(id);
                    }
                    _ => self.unmatched(id, cmd, "IF", diag),
                },
                EndIf => match stack.pop_if_kind(EraNestKind::If) {
                    Some(frame) => self.close_branches(frame, id),
                    None => self.unmatched(id, cmd, "IF", diag),
                },
                SelectCase => stack.push(EraNestFrame::new(EraNestKind::SelectCase, id)),
                Case | CaseElse => {
                    if !self.recover_selectcase_mismatch(&mut stack, id, diag) {
                        self.unmatched(id, cmd, "SELECTCASE", diag);
                        continue;
                    }
                    let Some(frame) = stack.last_mut() else {
                        continue;
                    };
                    if frame.has_default {
                        let msg = format!("{cmd} after CASEELSE");
                        self.line_error(id, EraDiagCategory::Nesting, None, msg, diag);
                        continue;
                    }
                    frame.has_default |= cmd == CaseElse;
                    frame.branches.push(id);
                }
                EndSelect => {
                    if !self.recover_selectcase_mismatch(&mut stack, id, diag) {
                        self.unmatched(id, cmd, "SELECTCASE", diag);
                        continue;
                    }
                    if let Some(frame) = stack.pop() {
                        self.check_case_kinds(func, &frame, diag);
                        self.close_branches(frame, id);
                    }
                }
                Repeat | For | While | Do => {
                    self.check_infinite_loop(id, cmd, &stack, diag);
                    stack.push(EraNestFrame::new(EraNestKind::Loop(cmd), id));
                }
                Rend | Next | Wend | Loop => match top {
                    Some(EraNestKind::Loop(opener)) if opener.loop_closer() == Some(cmd) => {
                        if let Some(frame) = stack.pop() {
                            self.link(frame.opener, id);
                            self.link(id, frame.opener);
                        }
                    }
                    Some(EraNestKind::Loop(opener)) => {
                        let msg = format!("{cmd} cannot close {opener}");
                        self.line_error(id, EraDiagCategory::Nesting, None, msg, diag);
                    }
                    _ => {
                        let opener = match cmd {
                            Rend => "REPEAT",
                            Next => "FOR",
                            Wend => "WHILE",
                            _ => "DO",
                        };
                        self.unmatched(id, cmd, opener, diag);
                    }
                },
                Break | Continue => {
                    let target = stack.iter().rev().find_map(|x| match x.kind {
                        EraNestKind::Loop(_) => Some(x.opener),
                        _ => None,
                    });
                    match target {
                        Some(opener) => self.link(id, opener),
                        None => {
                            let msg = format!("{cmd} outside of a loop");
                            self.line_error(id, EraDiagCategory::Nesting, None, msg, diag);
                        }
                    }
                }
                PrintData | PrintDataL | PrintDataW | StrData => {
                    stack.push(EraNestFrame::new(EraNestKind::Data, id));
                }
                Data | DataForm => match stack.last_mut() {
                    Some(frame)
                        if matches!(frame.kind, EraNestKind::Data | EraNestKind::DataList) =>
                    {
                        frame.branches.push(id);
                    }
                    _ => self.unmatched(id, cmd, "PRINTDATA or STRDATA", diag),
                },
                DataList => match stack.last_mut() {
                    Some(frame) if frame.kind == EraNestKind::Data => {
                        frame.branches.push(id);
                        stack.push(EraNestFrame::new(EraNestKind::DataList, id));
                    }
                    _ => self.unmatched(id, cmd, "PRINTDATA or STRDATA", diag),
                },
                EndList => match stack.pop_if_kind(EraNestKind::DataList) {
                    Some(frame) => self.close_branches(frame, id),
                    None => self.unmatched(id, cmd, "DATALIST", diag),
                },
                EndData => match stack.pop_if_kind(EraNestKind::Data) {
                    Some(frame) => {
                        let opener = frame.opener;
                        if let Some(inst) = self.program.inst_mut(opener) {
                            inst.branches = frame.branches;
                            inst.jump_to = Some(id);
                        }
                        self.link(id, opener);
                    }
                    None => self.unmatched(id, cmd, "PRINTDATA or STRDATA", diag),
                },
                TryCallList | TryJumpList | TryGotoList => {
                    stack.push(EraNestFrame::new(EraNestKind::TryList, id));
                }
                Func => match stack.last_mut() {
                    Some(frame) if frame.kind == EraNestKind::TryList => frame.branches.push(id),
                    _ => self.unmatched(id, cmd, "a TRY*LIST", diag),
                },
                EndFunc => match stack.pop_if_kind(EraNestKind::TryList) {
                    Some(frame) => self.close_branches(frame, id),
                    None => self.unmatched(id, cmd, "a TRY*LIST", diag),
                },
                NoSkip => {
                    if stack.iter().any(|x| x.kind == EraNestKind::NoSkip) {
                        let msg = "NOSKIP blocks cannot be nested".to_owned();
                        self.line_error(id, EraDiagCategory::Nesting, None, msg, diag);
                        continue;
                    }
                    stack.push(EraNestFrame::new(EraNestKind::NoSkip, id));
                }
                EndNoSkip => match stack.pop_if_kind(EraNestKind::NoSkip) {
                    Some(frame) => {
                        self.link(frame.opener, id);
                        self.link(id, frame.opener);
                    }
                    None => self.unmatched(id, cmd, "NOSKIP", diag),
                },
                Catch => match stack.pop_if_kind(EraNestKind::TryCatch) {
                    Some(frame) => {
                        self.link(frame.opener, id);
                        stack.push(EraNestFrame::new(EraNestKind::Catch, id));
                    }
                    None => self.unmatched(id, cmd, "a TRYC* command", diag),
                },
                EndCatch => match stack.pop_if_kind(EraNestKind::Catch) {
                    Some(frame) => self.link(frame.opener, id),
                    None => self.unmatched(id, cmd, "CATCH", diag),
                },
                _ if cmd.call_info().is_some_and(|x| x.has_catch) => {
                    stack.push(EraNestFrame::new(EraNestKind::TryCatch, id));
                }
                _ => (),
            }
        }

        for frame in stack {
            let opener = self.cmd_of(frame.opener).map_or("", |x| x.name());
            let msg = format!("{opener} without matching {}", frame.kind.closer());
            self.line_error(frame.opener, EraDiagCategory::Nesting, None, msg, diag);
        }
    }

    fn unmatched(&mut self, id: EraLineId, cmd: EraCmd, opener: &str, diag: &mut Diagnostic) {
        let msg = format!("{cmd} without matching {opener}");
        self.line_error(id, EraDiagCategory::Nesting, None, msg, diag);
    }

    /// Links an opener, its branches and its closer: the opener and every
    /// branch jump to the closer, and the closer jumps back to the opener.
    fn close_branches(&mut self, frame: EraNestFrame, closer: EraLineId) {
        for &branch in &frame.branches {
            self.link(branch, closer);
        }
        if let Some(inst) = self.program.inst_mut(frame.opener) {
            inst.branches = frame.branches;
            inst.jump_to = Some(closer);
        }
        self.link(closer, frame.opener);
    }

    /// Best-effort recovery for a `CASE`/`CASEELSE`/`ENDSELECT` reached while
    /// an inner construct is still open: frames are unwound one at a time,
    /// each with its own diagnostic, until a `SELECTCASE` is on top. Returns
    /// whether one was found.
    fn recover_selectcase_mismatch(
        &mut self,
        stack: &mut Vec<EraNestFrame>,
        at: EraLineId,
        diag: &mut Diagnostic,
    ) -> bool {
        let at_cmd = self.cmd_of(at).map_or("", |x| x.name());
        loop {
            match stack.last() {
                None => return false,
                Some(frame) if frame.kind == EraNestKind::SelectCase => return true,
                Some(_) => {
                    let Some(frame) = stack.pop() else {
                        return false;
                    };
                    let opener = self.cmd_of(frame.opener).map_or("", |x| x.name());
                    let msg = format!(
                        "{opener} is not closed by {} before {at_cmd}",
                        frame.kind.closer()
                    );
                    self.line_error(frame.opener, EraDiagCategory::Nesting, None, msg, diag);
                }
            }
        }
    }

    fn check_infinite_loop(
        &self,
        id: EraLineId,
        cmd: EraCmd,
        stack: &[EraNestFrame],
        diag: &mut Diagnostic,
    ) {
        let in_repeat = stack
            .iter()
            .any(|x| x.kind == EraNestKind::Loop(EraCmd::Repeat));
        match cmd {
            EraCmd::Repeat if in_repeat => {
                let msg = "REPEAT inside REPEAT shares COUNT and may never end".to_owned();
                self.line_warn(id, EraDiagCategory::InfiniteLoop, msg, diag);
            }
            EraCmd::For => {
                let Some(counter) = self.for_counter(id) else {
                    return;
                };
                if in_repeat && counter.0.eq_ignore_ascii_case("COUNT") && counter.1.iter().all(|&x| x == 0) {
                    let msg = "FOR on COUNT inside REPEAT may never end".to_owned();
                    self.line_warn(id, EraDiagCategory::InfiniteLoop, msg, diag);
                    return;
                }
                let shared = stack
                    .iter()
                    .filter(|x| x.kind == EraNestKind::Loop(EraCmd::For))
                    .any(|x| self.for_counter(x.opener).as_ref() == Some(&counter));
                if shared {
                    let msg = format!("nested FOR reuses the counter `{}` and may never end", counter.0);
                    self.line_warn(id, EraDiagCategory::InfiniteLoop, msg, diag);
                }
            }
            _ => (),
        }
    }

    /// The counter of a `FOR` line, when its indices are literals.
    fn for_counter(&self, id: EraLineId) -> Option<(ArcStr, SmallVec<[i64; 3]>)> {
        let Some(EraCmdArg::For { var, .. }) = self.program.inst(id)?.arg.as_ref() else {
            return None;
        };
        let indices = var
            .indices
            .iter()
            .map(|x| match x {
                EraExpr::Int(v, _) => Some(*v),
                _ => None,
            })
            .collect::<Option<_>>()?;
        Some((var.name.clone(), indices))
    }

    fn check_case_kinds(&mut self, func: EraLineId, frame: &EraNestFrame, diag: &mut Diagnostic) {
        let Some(scrutinee) = self
            .program
            .inst(frame.opener)
            .and_then(|x| x.arg.as_ref())
            .and_then(|x| x.as_expr())
            .and_then(|x| self.infer_kind(func, x))
        else {
            return;
        };
        for &branch in &frame.branches {
            let Some(EraCmdArg::Case(items)) = self.program.inst(branch).and_then(|x| x.arg.as_ref())
            else {
                continue;
            };
            let mismatch = items
                .iter()
                .flat_map(|item| match item {
                    EraCaseItem::Value(x) => [Some(x), None],
                    EraCaseItem::Range(lo, hi) => [Some(lo), Some(hi)],
                    EraCaseItem::Cond(_, x) => [Some(x), None],
                })
                .flatten()
                .filter_map(|x| self.infer_kind(func, x))
                .find(|&x| x != scrutinee);
            if let Some(kind) = mismatch {
                let msg = format!("CASE value is {kind}, but SELECTCASE compares {scrutinee}");
                self.line_error(branch, EraDiagCategory::Argument, None, msg, diag);
            }
        }
    }

    /// Static type of an expression, when it can be known without running it.
    fn infer_kind(&self, func: EraLineId, expr: &EraExpr) -> Option<ScalarValueKind> {
        use ScalarValueKind::{Int, Str};
        Some(match expr {
            EraExpr::Int(..) => Int,
            EraExpr::Str(..) | EraExpr::Form(..) => Str,
            EraExpr::Var(var) => return self.vars.kind_of(Some(func), &var.name),
            EraExpr::Call { name, .. } => {
                if is_builtin_method(name) {
                    if name.eq_ignore_ascii_case("TOSTR") || name.eq_ignore_ascii_case("UNICODE") {
                        Str
                    } else {
                        Int
                    }
                } else {
                    let target = self.labels.get_func(name)?;
                    return self.program.func(target)?.method_kind;
                }
            }
            EraExpr::Unary { op, operand, .. } => match op {
                EraUnaryOp::Pos => return self.infer_kind(func, operand),
                _ => Int,
            },
            EraExpr::Binary { op, lhs, .. } => match op {
                EraBinaryOp::Add | EraBinaryOp::Mul => return self.infer_kind(func, lhs),
                _ => Int,
            },
            EraExpr::Ternary { then, .. } => return self.infer_kind(func, then),
        })
    }

    // ----- Pass 3: targets -----

    fn resolve_targets(&mut self, func: EraLineId, diag: &mut Diagnostic, reached: &mut Vec<EraLineId>) {
        let body: Vec<_> = self.program.body_of(func).collect();
        for id in body {
            let Some(inst) = self.program.inst(id) else {
                continue;
            };
            let Some(arg) = inst.arg.as_ref().filter(|_| inst.error.is_none()) else {
                continue;
            };
            let cmd = inst.cmd;

            let mut calls = Vec::new();
            arg.walk_exprs(&mut |expr| {
                if let EraExpr::Call { name, args, .. } = expr {
                    calls.push((name.clone(), args.len()));
                }
            });
            let mut error = calls
                .iter()
                .find_map(|(name, argc)| match self.resolve_method(name, *argc) {
                    Ok(Some(target)) => {
                        reached.push(target);
                        None
                    }
                    Ok(None) => None,
                    Err(e) => Some(e),
                });

            if error.is_none() {
                let call = match (cmd.call_info(), arg) {
                    (Some(info), EraCmdArg::Call { target, args }) => {
                        Some((info.kind, info.is_try, info.is_method_call, target, args.len()))
                    }
                    (Some(info), EraCmdArg::Goto(target)) => {
                        Some((info.kind, info.is_try, false, target, 0))
                    }
                    _ => None,
                };
                match call {
                    Some((_, _, _, EraCallTarget::Form(_), _)) => self.has_indirect_call = true,
                    Some((kind, is_try, is_method_call, EraCallTarget::Name(name), argc)) => {
                        match self.resolve_call(func, kind, name, is_try, is_method_call, argc) {
                            Ok(target) => {
                                if kind != EraCallKind::Goto {
                                    reached.extend(target);
                                }
                                if let Some(inst) = self.program.inst_mut(id) {
                                    inst.target = target;
                                }
                            }
                            Err(e) => error = Some(e),
                        }
                    }
                    None => (),
                }
            }
            if let (None, Some(kind)) = (&error, cmd.list_call_kind()) {
                self.resolve_list(func, id, kind, reached);
            }
            if let Some(msg) = error {
                self.line_error(id, EraDiagCategory::Jump, None, msg, diag);
            }
        }
    }

    /// Resolves the `FUNC` lines of a `TRY*LIST`. Missing targets are
    /// allowed.
    fn resolve_list(
        &mut self,
        func: EraLineId,
        opener: EraLineId,
        kind: EraCallKind,
        reached: &mut Vec<EraLineId>,
    ) {
        let branches = self
            .program
            .inst(opener)
            .map(|x| x.branches.clone())
            .unwrap_or_default();
        for branch in branches {
            let name = match self.program.inst(branch).and_then(|x| x.arg.as_ref()) {
                Some(EraCmdArg::Call {
                    target: EraCallTarget::Name(name),
                    args,
                }) => Some((name.clone(), args.len())),
                Some(EraCmdArg::Call {
                    target: EraCallTarget::Form(_),
                    ..
                }) => {
                    self.has_indirect_call = true;
                    None
                }
                _ => None,
            };
            let Some((name, argc)) = name else {
                continue;
            };
            if let Ok(target) = self.resolve_call(func, kind, &name, true, false, argc) {
                if kind != EraCallKind::Goto {
                    reached.extend(target);
                }
                if let Some(inst) = self.program.inst_mut(branch) {
                    inst.target = target;
                }
            }
        }
    }

    fn resolve_call(
        &self,
        func: EraLineId,
        kind: EraCallKind,
        name: &str,
        is_try: bool,
        is_method_call: bool,
        argc: usize,
    ) -> Result<Option<EraLineId>, String> {
        if kind == EraCallKind::Goto {
            return match self.labels.get_goto(func, name) {
                Some(target) => Ok(Some(target)),
                None if is_try => Ok(None),
                None => Err(format!("undefined label `${name}`")),
            };
        }
        if let Some(target) = self.labels.get_func(name) {
            let Some(label) = self.program.func(target) else {
                return Err(format!("`{name}` does not name a function"));
            };
            if is_method_call && !label.is_method() {
                return Err(format!("`{name}` is not a #FUNCTION"));
            }
            if !is_method_call && label.is_method() {
                return Err(format!("`{name}` is a #FUNCTION; use CALLF"));
            }
            if argc > label.params.len() {
                return Err(format!(
                    "too many arguments: `{name}` takes {}, got {argc}",
                    label.params.len()
                ));
            }
            return Ok(Some(target));
        }
        if self.labels.is_event(name) {
            return if self.opts.compat_call_event_as_function {
                Ok(None)
            } else {
                Err(format!("event function `{name}` cannot be called directly"))
            };
        }
        if is_try {
            Ok(None)
        } else {
            Err(format!("undefined function `{name}`"))
        }
    }

    /// Checks a call inside an expression, which must reach a builtin or a
    /// `#FUNCTION`/`#FUNCTIONS`.
    fn resolve_method(&self, name: &str, argc: usize) -> Result<Option<EraLineId>, String> {
        if is_builtin_method(name) {
            return Ok(None);
        }
        let Some(target) = self.labels.get_func(name) else {
            return Err(format!("undefined function `{name}`"));
        };
        let Some(label) = self.program.func(target).filter(|x| x.is_method()) else {
            return Err(format!("`{name}` is not a #FUNCTION and cannot be used in an expression"));
        };
        if argc > label.params.len() {
            return Err(format!(
                "too many arguments: `{name}` takes {}, got {argc}",
                label.params.len()
            ));
        }
        Ok(Some(target))
    }
}

trait EraNestStack {
    fn pop_if_kind(&mut self, kind: EraNestKind) -> Option<EraNestFrame>;
}

impl EraNestStack for Vec<EraNestFrame> {
    fn pop_if_kind(&mut self, kind: EraNestKind) -> Option<EraNestFrame> {
        if self.last().is_some_and(|x| x.kind == kind) {
            self.pop()
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use indoc::indoc;

    use super::*;
    use crate::{line::EraLineKind, loader::EraScriptLoader, vars::EraLocalSizes};

    struct Loaded {
        program: EraProgram,
        labels: EraLabelDirectory,
        vars: EraVarPool,
        defines: EraDefineScope,
    }

    fn load(src: &str) -> Loaded {
        let defines = EraDefineScope::new();
        let mut vars = EraVarPool::new();
        let mut loader = EraScriptLoader::new(false, true);
        let mut diag = Diagnostic::new();
        loader.load_file(arcstr::literal!("T.ERB"), src, &defines, &vars, &mut diag);
        assert!(diag.is_empty(), "load diagnostics: {:?}", diag.entries());
        let sizes = EraLocalSizes {
            local: 10,
            locals: 10,
            arg: 10,
            args: 10,
        };
        let (program, labels) = loader.finish(&mut vars, sizes, &mut diag);
        Loaded {
            program,
            labels,
            vars,
            defines,
        }
    }

    fn validate(loaded: &mut Loaded, opts: EraValidateOptions) -> (EraValidateSummary, Diagnostic) {
        let ctx = EraExprCtx::new(Some(&loaded.defines), true);
        let mut validator =
            EraValidator::new(&mut loaded.program, &loaded.labels, &loaded.vars, ctx, opts);
        let mut diag = Diagnostic::new();
        let summary = validator.validate_all(&mut diag);
        (summary, diag)
    }

    fn errors(diag: &Diagnostic) -> Vec<(u32, String)> {
        diag.entries()
            .iter()
            .filter(|x| x.level == DiagnosticLevel::Error)
            .map(|x| (x.loc.line, x.message.clone()))
            .collect()
    }

    /// Finds the line at `line` (1-based) of the only file.
    fn line_at(program: &EraProgram, line: u32) -> EraLineId {
        (0..program.len() as u32)
            .map(EraLineId)
            .find(|&x| {
                program
                    .get(x)
                    .is_some_and(|l| l.loc.line == line && !matches!(l.kind, EraLineKind::Null))
            })
            .expect("line exists")
    }

    #[test]
    fn openers_and_closers_link_both_ways() {
        let mut loaded = load(indoc! {"
            @SYSTEM_TITLE
            REPEAT 3
                FOR LOCAL, 0, 5
                    IF LOCAL == 1
                        CONTINUE
                    ELSEIF LOCAL == 2
                        BREAK
                    ELSE
                        A += 1
                    ENDIF
                NEXT
            REND
            WHILE A < 10
                SELECTCASE A
                    CASE 1, 2 TO 4
                        A += 2
                    CASEELSE
                        A += 1
                ENDSELECT
            WEND
            DO
            LOOP A < 20
        "});
        let (_, diag) = validate(&mut loaded, EraValidateOptions::default());
        assert!(diag.is_empty(), "{:?}", diag.entries());
        let program = &loaded.program;
        let jump = |line: u32| program.inst(line_at(program, line)).and_then(|x| x.jump_to);
        let id = |line: u32| Some(line_at(program, line));
        for (open, close) in [(2, 12), (3, 11), (4, 10), (13, 20), (14, 19), (21, 22)] {
            assert_eq!(jump(open), id(close), "opener at line {open}");
            assert_eq!(jump(close), id(open), "closer at line {close}");
        }
        // Branches jump to the closer when reached by falling through
        assert_eq!(jump(6), id(10));
        assert_eq!(jump(8), id(10));
        assert_eq!(jump(17), id(19));
        let branches = &program.inst(line_at(program, 4)).expect("IF").branches;
        assert_eq!(branches.as_slice(), &[line_at(program, 6), line_at(program, 8)]);
        // BREAK and CONTINUE point at the innermost loop
        assert_eq!(jump(5), id(3));
        assert_eq!(jump(7), id(3));
    }

    #[test]
    fn every_unclosed_opener_is_reported_once() {
        let mut loaded = load(indoc! {"
            @SYSTEM_TITLE
            WHILE 1
                WHILE 1
                    WHILE 1
        "});
        let (_, diag) = validate(&mut loaded, EraValidateOptions::default());
        let errors = errors(&diag);
        assert_eq!(errors.len(), 3);
        let mut lines: Vec<_> = errors.iter().map(|x| x.0).collect();
        lines.sort_unstable();
        assert_eq!(lines, [2, 3, 4]);
        assert!(errors.iter().all(|x| x.1.contains("WEND")));
    }

    #[test]
    fn selectcase_recovery_unwinds_inner_frames() {
        let mut loaded = load(indoc! {"
            @SYSTEM_TITLE
            SELECTCASE A
                CASE 1
                    IF A
                        REPEAT 2
                CASE 2
                    B = 1
            ENDSELECT
            IF B
                CASE 3
            ENDIF
        "});
        let (_, diag) = validate(&mut loaded, EraValidateOptions::default());
        let errors = errors(&diag);
        let lines: Vec<_> = errors.iter().map(|x| x.0).collect();
        // REPEAT and IF unwound at the second CASE, then the stray CASE
        // unwinds the outer IF and finds nothing, leaving ENDIF unmatched
        assert_eq!(lines, [5, 4, 9, 10, 11]);
        let program = &loaded.program;
        let select = program.inst(line_at(program, 2)).expect("SELECTCASE");
        assert_eq!(select.jump_to, Some(line_at(program, 8)));
        assert_eq!(select.branches.len(), 2);
    }

    #[test]
    fn break_outside_loop_flags_the_line() {
        let mut loaded = load(indoc! {"
            @SYSTEM_TITLE
            IF A
                BREAK
            ENDIF
            REND
        "});
        let (_, diag) = validate(&mut loaded, EraValidateOptions::default());
        let errors = errors(&diag);
        assert_eq!(errors.len(), 2);
        let program = &loaded.program;
        assert!(program.get(line_at(program, 3)).and_then(|x| x.error()).is_some());
        assert!(program.get(line_at(program, 5)).and_then(|x| x.error()).is_some());
    }

    #[test]
    fn infinite_loop_shapes_only_warn() {
        let mut loaded = load(indoc! {"
            @SYSTEM_TITLE
            REPEAT 2
                REPEAT 2
                REND
                FOR COUNT, 0, 3
                NEXT
            REND
            FOR LOCAL:1, 0, 3
                FOR LOCAL:1, 0, 3
                NEXT
            NEXT
        "});
        let (_, diag) = validate(&mut loaded, EraValidateOptions::default());
        assert!(!diag.has_error());
        let warnings: Vec<_> = diag
            .entries()
            .iter()
            .filter(|x| x.category == EraDiagCategory::InfiniteLoop)
            .map(|x| x.loc.line)
            .collect();
        assert_eq!(warnings, [3, 5, 9]);
    }

    #[test]
    fn data_and_list_blocks() {
        let mut loaded = load(indoc! {"
            @SYSTEM_TITLE
            PRINTDATAL
                DATA one
                DATALIST
                    DATA two
                    PRINTL nope
                ENDLIST
                STRDATA STR
            ENDDATA
            TRYCALLLIST
                FUNC MISSING
                FUNC HELPER(1)
            ENDFUNC
            @HELPER(X)
        "});
        let (_, diag) = validate(&mut loaded, EraValidateOptions::default());
        let lines: Vec<_> = errors(&diag).iter().map(|x| x.0).collect();
        assert_eq!(lines, [6, 8]);
        let program = &loaded.program;
        let data = program.inst(line_at(program, 2)).expect("PRINTDATAL");
        assert_eq!(data.jump_to, Some(line_at(program, 9)));
        assert_eq!(data.branches.len(), 2);
        let helper = loaded.labels.get_func("HELPER");
        assert_eq!(program.inst(line_at(program, 12)).and_then(|x| x.target), helper);
        assert_eq!(program.inst(line_at(program, 11)).and_then(|x| x.target), None);
    }

    #[test]
    fn call_targets_resolve_by_kind() {
        let mut loaded = load(indoc! {"
            @SYSTEM_TITLE
            CALL NOWHERE
            TRYCALL NOWHERE
            CALL EVENTTRAIN
            CALLF HELPER
            CALL HELPER, 1, 2
            CALL HELPER, 1
            A = SQUARE(2) + MAX(1, 2)
            A = HELPER(1)
            GOTO NOLABEL
            @HELPER(X)
            @SQUARE(X)
            #FUNCTION
            RETURNF X * X
            @EVENTTRAIN
        "});
        let (summary, diag) = validate(&mut loaded, EraValidateOptions::default());
        let lines: Vec<_> = errors(&diag).iter().map(|x| x.0).collect();
        assert_eq!(lines, [2, 4, 5, 6, 9, 10]);
        assert!(!summary.has_indirect_call);
        let program = &loaded.program;
        assert_eq!(
            program.inst(line_at(program, 7)).and_then(|x| x.target),
            loaded.labels.get_func("HELPER")
        );
        let square = loaded.labels.get_func("SQUARE").and_then(|x| program.func(x));
        assert!(square.is_some_and(|x| x.checked && x.depth == 0));
        let helper = loaded.labels.get_func("HELPER").and_then(|x| program.func(x));
        assert!(helper.is_some_and(|x| x.checked && x.depth == 1));
    }

    #[test]
    fn event_calls_follow_compat_flag() {
        let src = "@SYSTEM_TITLE\nCALL EVENTTRAIN\n@EVENTTRAIN\n";
        let mut loaded = load(src);
        let opts = EraValidateOptions {
            compat_call_event_as_function: true,
            ..Default::default()
        };
        let (_, diag) = validate(&mut loaded, opts);
        assert!(diag.is_empty());
    }

    #[test]
    fn method_bodies_are_restricted() {
        let mut loaded = load(indoc! {"
            @SYSTEM_TITLE
            A = GETX()
            @GETX
            #FUNCTION
            PRINTL not here
            RETURN 1
            RETURNF 2
        "});
        let (_, diag) = validate(&mut loaded, EraValidateOptions::default());
        let lines: Vec<_> = errors(&diag).iter().map(|x| x.0).collect();
        assert_eq!(lines, [5, 6]);
    }

    #[test]
    fn argument_checks() {
        let mut loaded = load(indoc! {"
            @SYSTEM_TITLE
            NOSUCHVAR = 1
            SELECTCASE A
                CASE \"text\"
            ENDSELECT
            CALL WITH_DEFAULTS
            @WITH_DEFAULTS(A, S = \"x\")
        "});
        let (_, diag) = validate(&mut loaded, EraValidateOptions::default());
        let lines: Vec<_> = errors(&diag).iter().map(|x| x.0).collect();
        assert_eq!(lines, [2, 4, 7]);
    }

    #[test]
    fn unreferenced_functions_follow_policy() {
        let src = "@SYSTEM_TITLE\n@A1\n@A2\n";
        let run = |policy| {
            let mut loaded = load(src);
            let opts = EraValidateOptions {
                unreferenced_policy: policy,
                ..Default::default()
            };
            let (summary, diag) = validate(&mut loaded, opts);
            let unchecked = loaded
                .program
                .function_ids()
                .filter(|&x| loaded.program.func(x).is_some_and(|x| !x.checked))
                .count();
            (summary, diag.entries().len(), unchecked)
        };
        let (summary, shown, unchecked) = run(EraUnreferencedPolicy::Display);
        assert_eq!((summary.unreferenced, shown, unchecked), (2, 2, 2));
        let (_, shown, _) = run(EraUnreferencedPolicy::OncePerFile);
        assert_eq!(shown, 1);
        let (_, shown, _) = run(EraUnreferencedPolicy::Ignore);
        assert_eq!(shown, 0);
        let (summary, shown, _) = run(EraUnreferencedPolicy::Deferred);
        assert_eq!(shown, 0);
        assert_eq!(summary.deferred.map(|x| x.entries().len()), Some(2));

        // Indirect calls make reachability unknowable
        let mut loaded = load("@SYSTEM_TITLE\nCALLFORM A{A}\n@A1\n@A2\n");
        let (summary, diag) = validate(&mut loaded, EraValidateOptions::default());
        assert!(summary.has_indirect_call);
        assert!(diag.is_empty());
        assert_eq!(summary.validated, 3);
    }
}
