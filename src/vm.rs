use std::sync::atomic::{AtomicBool, Ordering};

use arcstr::ArcStr;
use log::error;

use crate::{
    commands::{EraCallCmdInfo, EraCallKind, EraCallTarget, EraCaseItem, EraCmd, EraCmdArg, EraPrintEnd},
    expr::{EraBinaryOp, EraExpr, EraFormPart, EraFormString, EraVarRef},
    interpret::{apply_binary, apply_unary, call_builtin, is_builtin_method, pad_text},
    labels::{EraLabelDirectory, EVENT_GROUP_COUNT, EVENT_GROUP_NORMAL},
    lexer::normalize_ident,
    line::{EraFuncFlags, EraInstruction, EraLineId, EraLineKind, EraProgram},
    process::*,
    types::*,
    vars::{EraVarArray, EraVarCell, EraVarPool},
};

pub(crate) type EraVmResult<T> = Result<T, Box<EraRuntimeError>>;

const WATCHDOG_CHECK_INTERVAL: u64 = 1 << 12;
const STACK_RED_ZONE: usize = 128 * 1024;
const STACK_GROWTH: usize = 2 * 1024 * 1024;
const DRAWLINE_WIDTH: usize = 60;

/// Outcome of driving the machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EraStep {
    Continue,
    Break(EraExecutionBreakReason),
    /// The function must be validated before it is entered. The entry stays
    /// pending in the process state and is retried on the next run.
    Validate(EraLineId),
}

#[derive(Debug, Clone, Copy, Default)]
pub struct EraVmOptions {
    pub enable_debug: bool,
    pub ignore_case: bool,
    pub compat_call_event_as_function: bool,
    pub compat_call_function_as_event: bool,
    pub compat_optional_args: bool,
    pub compat_int_to_str_args: bool,
    pub watchdog_timeout_ms: u64,
}

enum EraCallee {
    Label(EraLineId),
    Event(ArcStr),
    Missing(ArcStr),
}

/// The call stack machine. Borrows everything it runs on, so it is cheap to
/// recreate after the program changes.
pub struct EraVm<'a, C> {
    pub(crate) program: &'a EraProgram,
    pub(crate) labels: &'a EraLabelDirectory,
    pub(crate) vars: &'a EraVarPool,
    pub(crate) state: &'a mut EraProcessState,
    pub(crate) callback: &'a mut C,
    pub(crate) opts: EraVmOptions,
    run_flag: &'a AtomicBool,
    /// The line being executed, for fault reports.
    pub(crate) site: Option<EraLineId>,
    eval_depth: usize,
}

impl<'a, C: EraCompilerCallback> EraVm<'a, C> {
    pub fn new(
        program: &'a EraProgram,
        labels: &'a EraLabelDirectory,
        vars: &'a EraVarPool,
        state: &'a mut EraProcessState,
        callback: &'a mut C,
        opts: EraVmOptions,
        run_flag: &'a AtomicBool,
    ) -> Self {
        EraVm {
            program,
            labels,
            vars,
            state,
            callback,
            opts,
            run_flag,
            site: None,
            eval_depth: 0,
        }
    }

    /// Alternates between the game flow and script lines until something
    /// breaks the loop. `budget` is the number of scheduling steps left.
    /// Never returns `EraStep::Continue`.
    pub fn execute(&mut self, budget: &mut u64) -> EraStep {
        let mut ticks = 0u64;
        loop {
            if !self.run_flag.load(Ordering::Relaxed) {
                return EraStep::Break(EraExecutionBreakReason::StopFlag);
            }
            if *budget == 0 {
                return EraStep::Break(EraExecutionBreakReason::ReachedMaxInstructions);
            }
            *budget -= 1;
            ticks += 1;
            if ticks % WATCHDOG_CHECK_INTERVAL == 0 && self.watchdog_fired() {
                return EraStep::Break(EraExecutionBreakReason::WatchdogAbort);
            }

            let step = match self.state.pending_entry.take() {
                Some(entry) => self.enter(entry),
                None if self.state.is_script_end() => self.advance_phase(),
                None => self.step(),
            };
            match step {
                Ok(EraStep::Continue) => (),
                Ok(step) => return step,
                Err(e) => {
                    let reason = self.report_fault(*e);
                    self.state.halt();
                    return EraStep::Break(reason);
                }
            }
        }
    }

    /// Runs until every frame above the floor has returned.
    pub fn run_nested(&mut self) -> EraVmResult<EraStep> {
        loop {
            if !self.run_flag.load(Ordering::Relaxed) {
                return Ok(EraStep::Break(EraExecutionBreakReason::StopFlag));
            }
            let step = match self.state.pending_entry.take() {
                Some(entry) => self.enter(entry)?,
                None if self.state.frames.len() <= self.state.floor => {
                    return Ok(EraStep::Continue)
                }
                None => self.step()?,
            };
            if step != EraStep::Continue {
                return Ok(step);
            }
        }
    }

    /// Logs and reports a fault and keeps it as the last error. Unwinding is
    /// left to the caller, which knows how much of the stack it owns.
    pub fn report_fault(&mut self, e: EraRuntimeError) -> EraExecutionBreakReason {
        error!("{e}");
        self.callback.on_runtime_error(&e);
        let reason = e.break_reason();
        self.state.last_error = Some(e);
        reason
    }

    fn watchdog_fired(&mut self) -> bool {
        let timeout = self.opts.watchdog_timeout_ms;
        if timeout == 0 {
            return false;
        }
        let idle = self.state.idle_ms();
        if idle < timeout {
            return false;
        }
        if self.callback.on_watchdog(idle) {
            return true;
        }
        self.state.reset_idle();
        false
    }

    // ----- Lines -----

    fn step(&mut self) -> EraVmResult<EraStep> {
        let program = self.program;
        let Some(id) = self.state.cursor else {
            return Err(self.internal("no line to execute"));
        };
        self.site = Some(id);
        let Some(line) = program.get(id) else {
            return Err(self.internal(format!("line {} is out of range", id.0)));
        };
        let inst = match &line.kind {
            EraLineKind::Instruction(inst) => inst,
            EraLineKind::Null => return self.do_return(None),
            EraLineKind::GotoLabel(_) => {
                self.state.cursor = Some(id.next());
                return Ok(EraStep::Continue);
            }
            EraLineKind::Invalid(msg) => return Err(self.fault(msg.clone())),
            EraLineKind::FunctionLabel(_) => {
                return Err(self.internal("execution ran into a function label"))
            }
        };
        if let Some(msg) = &inst.error {
            return Err(self.fault(msg.clone()));
        }
        let Some(arg) = &inst.arg else {
            return Err(self.internal(format!("{} was executed before validation", inst.cmd)));
        };
        self.state.cursor = Some(id.next());
        self.exec(id, inst, arg)
    }

    fn exec(
        &mut self,
        id: EraLineId,
        inst: &'a EraInstruction,
        arg: &'a EraCmdArg,
    ) -> EraVmResult<EraStep> {
        use EraCmd::*;

        let cmd = inst.cmd;
        if let Some(info) = cmd.call_info() {
            return self.exec_call(id, inst, info, arg);
        }
        if cmd.is_print_data() || cmd == StrData {
            self.exec_data(inst, arg)?;
            return Ok(EraStep::Continue);
        }
        match cmd {
            Print | PrintL | PrintW | PrintForm | PrintFormL | PrintFormW | PrintS | PrintSL
            | PrintSW | PrintV | PrintVL | PrintVW | PrintFormS | PrintFormSL | PrintFormSW
            | PrintSingle | PrintSingleForm | PrintSingleS | PrintSingleV | PrintSingleFormS => {
                let text = self.arg_text(arg)?;
                self.print(&text, cmd.print_end(), cmd.is_print_single());
            }
            DebugPrint | DebugPrintL => {
                if self.opts.enable_debug {
                    let text = self.arg_text(arg)?;
                    let flags = EraPrintExtendedFlags::new().with_is_line(cmd == DebugPrintL);
                    self.callback.on_debugprint(&text, flags);
                }
            }
            DrawLine => {
                let flags = EraPrintExtendedFlags::new().with_is_line(true);
                self.callback.on_print(&"-".repeat(DRAWLINE_WIDTH), flags);
            }
            Set => self.exec_assign(arg)?,
            VarSet => {
                let EraCmdArg::VarSet { var, value } = arg else {
                    return Err(self.bad_arg(cmd));
                };
                let cell = self.var_cell(&var.name)?;
                match value {
                    Some(value) => {
                        let value = self.eval(value)?;
                        let result = cell.borrow_mut().fill(value);
                        result.map_err(|e| self.fault(e))?;
                    }
                    None => cell.borrow_mut().clear(),
                }
            }
            Swap => {
                let EraCmdArg::Swap(a, b) = arg else {
                    return Err(self.bad_arg(cmd));
                };
                let (x, y) = (self.read_var(a)?, self.read_var(b)?);
                self.write_var(a, y)?;
                self.write_var(b, x)?;
            }
            Sif => {
                let cond = self.expr_arg(cmd, arg)?;
                if !self.eval(cond)?.is_truthy() {
                    let next = id.next();
                    if !matches!(
                        self.program.get(next).map(|x| &x.kind),
                        None | Some(EraLineKind::Null)
                    ) {
                        self.state.cursor = Some(next.next());
                    }
                }
            }
            If => self.exec_if(inst, arg)?,
            SelectCase => self.exec_select(inst, arg)?,
            // Reached by falling through the previous block
            ElseIf | Else | Case | CaseElse | Catch | Func | DataList => {
                self.state.cursor = Some(self.link(inst)?);
            }
            EndIf | EndSelect | EndFunc | EndCatch | EndData | EndList | Data | DataForm
            | NoSkip | EndNoSkip | Do => (),
            Repeat => {
                let n = self.expr_arg(cmd, arg)?;
                let n = self.eval_int(n)?;
                self.set_global("COUNT", 0, ScalarValue::Int(0))?;
                if n <= 0 {
                    self.state.cursor = Some(self.link(inst)?.next());
                }
            }
            Rend => {
                let opener = self.link(inst)?;
                let opener_inst = self.inst_at(opener)?;
                let n = self.expr_arg(Repeat, opener_inst.arg.as_ref().unwrap_or(&EraCmdArg::Empty))?;
                let count = self.global_int("COUNT", 0)?.wrapping_add(1);
                self.set_global("COUNT", 0, ScalarValue::Int(count))?;
                if count < self.eval_int(n)? {
                    self.state.cursor = Some(opener.next());
                }
            }
            For => {
                let EraCmdArg::For {
                    var,
                    start,
                    end,
                    step,
                } = arg
                else {
                    return Err(self.bad_arg(cmd));
                };
                let start = self.eval_int(start)?;
                self.write_var(var, ScalarValue::Int(start))?;
                let (end, step) = self.for_bounds(end, step.as_ref())?;
                if !for_continues(start, end, step) {
                    self.state.cursor = Some(self.link(inst)?.next());
                }
            }
            Next => {
                let opener = self.link(inst)?;
                let Some(EraCmdArg::For { var, end, step, .. }) = &self.inst_at(opener)?.arg else {
                    return Err(self.bad_arg(For));
                };
                let (end, step) = self.for_bounds(end, step.as_ref())?;
                let value = self.read_var(var)?;
                let value = self.as_int(&value)?.wrapping_add(step);
                self.write_var(var, ScalarValue::Int(value))?;
                if for_continues(value, end, step) {
                    self.state.cursor = Some(opener.next());
                }
            }
            While => {
                let cond = self.expr_arg(cmd, arg)?;
                if !self.eval(cond)?.is_truthy() {
                    self.state.cursor = Some(self.link(inst)?.next());
                }
            }
            Wend => self.state.cursor = Some(self.link(inst)?),
            Loop => {
                let cond = self.expr_arg(cmd, arg)?;
                if self.eval(cond)?.is_truthy() {
                    self.state.cursor = Some(self.link(inst)?.next());
                }
            }
            Break | Continue => {
                let opener = self.link(inst)?;
                let closer = self.link(self.inst_at(opener)?)?;
                self.state.cursor = Some(if cmd == Break { closer.next() } else { closer });
            }
            TryCallList | TryJumpList | TryGotoList => return self.exec_call_list(id, inst),
            Return => {
                let EraCmdArg::ExprList(list) = arg else {
                    return Err(self.bad_arg(cmd));
                };
                let mut first = None;
                let (mut ints, mut strs) = (0, 0);
                for x in list {
                    let value = self.eval(x)?;
                    if value.is_str() {
                        self.set_global("RESULTS", strs, value.clone())?;
                        strs += 1;
                    } else {
                        self.set_global("RESULT", ints, value.clone())?;
                        ints += 1;
                    }
                    first.get_or_insert(value);
                }
                if first.is_none() {
                    self.set_global("RESULT", 0, ScalarValue::Int(0))?;
                }
                return self.do_return(Some(first.unwrap_or(ScalarValue::Int(0))));
            }
            ReturnF => {
                let value = match arg {
                    EraCmdArg::Expr(x) => Some(self.eval(x)?),
                    _ => None,
                };
                return self.do_return(value);
            }
            ReturnForm => {
                let text = self.arg_text(arg)?;
                let mut first = None;
                for (i, part) in text.split(',').enumerate() {
                    let Ok(value) = part.trim().parse::<i64>() else {
                        return Err(self.fault(format!("RETURNFORM expects integers, got `{}`", part.trim())));
                    };
                    self.set_global("RESULT", i as i64, ScalarValue::Int(value))?;
                    first.get_or_insert(ScalarValue::Int(value));
                }
                return self.do_return(first);
            }
            Restart => {
                let Some(label) = self.state.frames.last().map(|x| x.label) else {
                    return Err(self.internal("RESTART without an active frame"));
                };
                self.state.cursor = Some(label.next());
            }
            Begin => {
                let EraCmdArg::Begin(kind) = arg else {
                    return Err(self.bad_arg(cmd));
                };
                self.state.pending_begin = Some(*kind);
                let floor = self.state.floor;
                self.state.frames.truncate(floor);
                self.state.cursor = None;
            }
            Throw => {
                let text = self.arg_text(arg)?;
                return Err(self.fault(text));
            }
            Quit => {
                let floor = self.state.floor;
                self.state.frames.truncate(floor);
                self.state.cursor = None;
                if floor > 0 {
                    // Frames below belong to an outer run, which keeps going.
                    return Ok(EraStep::Break(EraExecutionBreakReason::CodeQuit));
                }
                self.state.set_phase(crate::flow::EraPhase::Quit);
            }
            Wait => self.callback.on_wait(false, false),
            Input | InputS => return self.exec_input(id, cmd),
            SaveGame | LoadGame => {
                self.state.push_snapshot();
                self.state.set_phase(if cmd == SaveGame {
                    crate::flow::EraPhase::SaveGameShowMenu
                } else {
                    crate::flow::EraPhase::LoadGameShowMenu
                });
            }
            _ => return Err(self.internal(format!("{cmd} has no handler"))),
        }
        Ok(EraStep::Continue)
    }

    fn exec_assign(&mut self, arg: &EraCmdArg) -> EraVmResult<()> {
        let EraCmdArg::Assign { lhs, op, rhs } = arg else {
            // A bare `+`/`-` line
            return match arg {
                EraCmdArg::Empty => Ok(()),
                _ => Err(self.bad_arg(EraCmd::Set)),
            };
        };
        let value = match op {
            None => self.eval(rhs)?,
            Some(op) => {
                let current = self.read_var(lhs)?;
                let rhs = self.eval(rhs)?;
                apply_binary(*op, current, rhs).map_err(|e| self.fault(e))?
            }
        };
        self.write_var(lhs, value)
    }

    fn exec_if(&mut self, inst: &'a EraInstruction, arg: &'a EraCmdArg) -> EraVmResult<()> {
        let cond = self.expr_arg(inst.cmd, arg)?;
        if self.eval(cond)?.is_truthy() {
            return Ok(());
        }
        for &branch in &inst.branches {
            let branch_inst = self.inst_at(branch)?;
            let taken = match (branch_inst.cmd, &branch_inst.arg) {
                (EraCmd::Else, _) => true,
                (EraCmd::ElseIf, Some(EraCmdArg::Expr(cond))) => self.eval(cond)?.is_truthy(),
                (cmd, _) => return Err(self.bad_arg(cmd)),
            };
            if taken {
                self.state.cursor = Some(branch.next());
                return Ok(());
            }
        }
        self.state.cursor = Some(self.link(inst)?);
        Ok(())
    }

    fn exec_select(&mut self, inst: &'a EraInstruction, arg: &'a EraCmdArg) -> EraVmResult<()> {
        let subject = self.expr_arg(inst.cmd, arg)?;
        let value = self.eval(subject)?;
        for &branch in &inst.branches {
            let branch_inst = self.inst_at(branch)?;
            let taken = match (branch_inst.cmd, &branch_inst.arg) {
                (EraCmd::CaseElse, _) => true,
                (EraCmd::Case, Some(EraCmdArg::Case(items))) => self.case_matches(&value, items)?,
                (cmd, _) => return Err(self.bad_arg(cmd)),
            };
            if taken {
                self.state.cursor = Some(branch.next());
                return Ok(());
            }
        }
        self.state.cursor = Some(self.link(inst)?);
        Ok(())
    }

    fn case_matches(&mut self, value: &ScalarValue, items: &[EraCaseItem]) -> EraVmResult<bool> {
        for item in items {
            let matched = match item {
                EraCaseItem::Value(x) => {
                    let x = self.eval(x)?;
                    self.compare(EraBinaryOp::Eq, value, x)?
                }
                EraCaseItem::Range(lo, hi) => {
                    let (lo, hi) = (self.eval(lo)?, self.eval(hi)?);
                    self.compare(EraBinaryOp::GEq, value, lo)?
                        && self.compare(EraBinaryOp::LEq, value, hi)?
                }
                EraCaseItem::Cond(op, x) => {
                    let x = self.eval(x)?;
                    self.compare(*op, value, x)?
                }
            };
            if matched {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn compare(&self, op: EraBinaryOp, lhs: &ScalarValue, rhs: ScalarValue) -> EraVmResult<bool> {
        apply_binary(op, lhs.clone(), rhs)
            .map(|x| x.is_truthy())
            .map_err(|e| self.fault(e))
    }

    fn for_bounds(&mut self, end: &EraExpr, step: Option<&EraExpr>) -> EraVmResult<(i64, i64)> {
        let end = self.eval_int(end)?;
        let step = match step {
            Some(step) => self.eval_int(step)?,
            None => 1,
        };
        Ok((end, step))
    }

    /// Picks one `DATA`/`DATAFORM`/`DATALIST` item at random.
    fn exec_data(&mut self, inst: &'a EraInstruction, arg: &'a EraCmdArg) -> EraVmResult<()> {
        let text = if inst.branches.is_empty() {
            String::new()
        } else {
            let pick = self.callback.on_get_rand() % inst.branches.len() as u64;
            self.data_text(inst.branches[pick as usize])?
        };
        if inst.cmd == EraCmd::StrData {
            match arg {
                EraCmdArg::Var(Some(var)) => self.write_var(var, ScalarValue::Str(text))?,
                _ => self.set_global("RESULTS", 0, ScalarValue::Str(text))?,
            }
        } else {
            self.print(&text, inst.cmd.print_end(), false);
        }
        self.state.cursor = Some(self.link(inst)?.next());
        Ok(())
    }

    fn data_text(&mut self, id: EraLineId) -> EraVmResult<String> {
        let inst = self.inst_at(id)?;
        match (inst.cmd, &inst.arg) {
            (EraCmd::DataList, _) => {
                let mut lines = Vec::with_capacity(inst.branches.len());
                for &item in &inst.branches {
                    lines.push(self.data_text(item)?);
                }
                Ok(lines.join("\n"))
            }
            (EraCmd::Data | EraCmd::DataForm, Some(arg)) => self.arg_text(arg),
            (cmd, _) => Err(self.bad_arg(cmd)),
        }
    }

    fn exec_input(&mut self, id: EraLineId, cmd: EraCmd) -> EraVmResult<EraStep> {
        let waiting = EraStep::Break(EraExecutionBreakReason::WaitingForInput);
        let Some(input) = self.state.take_input() else {
            self.state.cursor = Some(id);
            return Ok(waiting);
        };
        if cmd == EraCmd::InputS {
            self.set_global("RESULTS", 0, ScalarValue::Str(input.into_string()))?;
        } else {
            let Some(value) = input.as_int() else {
                self.state.cursor = Some(id);
                return Ok(waiting);
            };
            self.set_global("RESULT", 0, ScalarValue::Int(value))?;
        }
        Ok(EraStep::Continue)
    }

    fn print(&mut self, text: &str, end: EraPrintEnd, is_single: bool) {
        let flags = EraPrintExtendedFlags::new()
            .with_is_single(is_single)
            .with_is_line(is_single || end != EraPrintEnd::None)
            .with_is_wait(end == EraPrintEnd::Wait);
        self.callback.on_print(text, flags);
        if end == EraPrintEnd::Wait {
            self.callback.on_wait(false, false);
        }
    }

    // ----- Calls -----

    fn exec_call(
        &mut self,
        id: EraLineId,
        inst: &'a EraInstruction,
        info: EraCallCmdInfo,
        arg: &'a EraCmdArg,
    ) -> EraVmResult<EraStep> {
        let (target, args): (&EraCallTarget, &[Option<EraExpr>]) = match arg {
            EraCmdArg::Call { target, args } => (target, args),
            EraCmdArg::Goto(target) => (target, &[]),
            _ => return Err(self.bad_arg(inst.cmd)),
        };
        let callee = match inst.target {
            Some(target) => EraCallee::Label(target),
            None => self.resolve_callee(info.kind, target)?,
        };
        match callee {
            EraCallee::Missing(name) => {
                if info.has_catch {
                    self.state.cursor = Some(self.link(inst)?.next());
                } else if !info.is_try {
                    return Err(self.fault(format!("undefined function or label `{name}`")));
                }
                Ok(EraStep::Continue)
            }
            EraCallee::Event(name) => {
                if !self.opts.compat_call_event_as_function {
                    return Err(self.fault(format!(
                        "`{name}` is an event function and cannot be called as a function"
                    )));
                }
                let is_jump = info.kind == EraCallKind::Jump;
                let return_to = (!is_jump).then(|| id.next());
                self.call_event(&name, return_to, Some(id), is_jump)
            }
            EraCallee::Label(target) => match info.kind {
                EraCallKind::Goto => {
                    self.state.cursor = Some(target);
                    Ok(EraStep::Continue)
                }
                EraCallKind::Call if info.is_method_call => {
                    self.call_method(target, args)?;
                    Ok(EraStep::Continue)
                }
                kind => {
                    let args = self.convert_args(target, args)?;
                    let mut frame = EraCallFrame::new(target);
                    frame.call_site = Some(id);
                    if kind == EraCallKind::Jump {
                        frame.is_jump = true;
                    } else {
                        frame.return_to = Some(id.next());
                    }
                    self.enter(EraPendingEntry { frame, args })
                }
            },
        }
    }

    /// Calls the first existing target of a `TRY*LIST` block.
    fn exec_call_list(&mut self, id: EraLineId, inst: &'a EraInstruction) -> EraVmResult<EraStep> {
        let Some(kind) = inst.cmd.list_call_kind() else {
            return Err(self.bad_arg(inst.cmd));
        };
        let end = self.link(inst)?;
        for &branch in &inst.branches {
            let branch_inst = self.inst_at(branch)?;
            let Some(EraCmdArg::Call { target, args }) = &branch_inst.arg else {
                return Err(self.bad_arg(branch_inst.cmd));
            };
            let callee = match branch_inst.target {
                Some(target) => EraCallee::Label(target),
                None => self.resolve_callee(kind, target)?,
            };
            let EraCallee::Label(target) = callee else {
                continue;
            };
            if kind == EraCallKind::Goto {
                self.state.cursor = Some(target);
                return Ok(EraStep::Continue);
            }
            let args = self.convert_args(target, args)?;
            let mut frame = EraCallFrame::new(target);
            frame.call_site = Some(id);
            if kind == EraCallKind::Jump {
                frame.is_jump = true;
            } else {
                frame.return_to = Some(end.next());
            }
            return self.enter(EraPendingEntry { frame, args });
        }
        self.state.cursor = Some(end.next());
        Ok(EraStep::Continue)
    }

    fn resolve_callee(&mut self, kind: EraCallKind, target: &EraCallTarget) -> EraVmResult<EraCallee> {
        let name = match target {
            EraCallTarget::Name(name) => name.clone(),
            EraCallTarget::Form(form) => {
                let text = self.eval_form(form)?;
                normalize_ident(text.trim(), self.opts.ignore_case)
            }
        };
        if kind == EraCallKind::Goto {
            let func = self.current_func()?;
            return Ok(match self.labels.get_goto(func, &name) {
                Some(target) => EraCallee::Label(target),
                None => EraCallee::Missing(name),
            });
        }
        Ok(match self.labels.get_func(&name) {
            Some(target) => EraCallee::Label(target),
            None if self.labels.is_event(&name) => EraCallee::Event(name),
            None => EraCallee::Missing(name),
        })
    }

    /// Binds call-site arguments to the parameters of `target`.
    fn convert_args(
        &mut self,
        target: EraLineId,
        args: &[Option<EraExpr>],
    ) -> EraVmResult<Vec<EraBoundArg>> {
        let program = self.program;
        let Some(label) = program.func(target) else {
            return Err(self.internal(format!("line {} is not a function", target.0)));
        };
        let name = &label.name;
        if args.len() > label.params.len() {
            return Err(self.fault(format!(
                "too many arguments: `{name}` takes {}, got {}",
                label.params.len(),
                args.len()
            )));
        }
        if args.is_empty() && !label.params.is_empty() && !self.opts.compat_optional_args {
            return Err(self.fault(format!("`{name}` expects arguments")));
        }

        let vars = self.vars;
        let func_vars = vars.func(target);
        let mut out = Vec::with_capacity(label.params.len());
        for (i, param) in label.params.iter().enumerate() {
            let decl = func_vars.and_then(|x| x.decl(&param.name));
            let is_ref = decl.is_some_and(|x| x.is_ref());
            match args.get(i).and_then(Option::as_ref) {
                Some(expr) if is_ref => {
                    let Some(var) = expr.as_var() else {
                        return Err(self.fault(format!(
                            "argument {} of `{name}` is a reference and needs a variable",
                            i + 1
                        )));
                    };
                    let cell = self.var_cell(&var.name)?;
                    let compatible = {
                        let arr = cell.borrow();
                        decl.map_or(true, |d| {
                            arr.kind() == d.kind
                                && (d.dims.is_empty() || arr.dims().len() == d.dims.len())
                        })
                    };
                    if !compatible {
                        return Err(self.fault(format!(
                            "argument {} of `{name}` does not match the reference's type or shape",
                            i + 1
                        )));
                    }
                    out.push(EraBoundArg::Ref(cell));
                }
                Some(expr) => {
                    let value = self.eval(expr)?;
                    let kind = vars
                        .kind_of(Some(target), &param.name)
                        .unwrap_or(ScalarValueKind::Int);
                    out.push(EraBoundArg::Value(self.coerce_arg(value, kind, i, name)?));
                }
                None if is_ref => {
                    return Err(self.fault(format!(
                        "reference argument {} of `{name}` is missing",
                        i + 1
                    )))
                }
                None => match label.defaults.get(i).cloned().flatten() {
                    Some(value) => out.push(EraBoundArg::Value(value)),
                    None => {
                        return Err(self.fault(format!(
                            "argument {} of `{name}` is missing and has no default",
                            i + 1
                        )))
                    }
                },
            }
        }
        Ok(out)
    }

    fn coerce_arg(
        &self,
        value: ScalarValue,
        kind: ScalarValueKind,
        index: usize,
        name: &str,
    ) -> EraVmResult<ScalarValue> {
        match (value, kind) {
            (ScalarValue::Int(x), ScalarValueKind::Str) if self.opts.compat_int_to_str_args => {
                Ok(ScalarValue::Str(x.to_string()))
            }
            (ScalarValue::Int(_), ScalarValueKind::Str) => Err(self.fault(format!(
                "argument {} of `{name}` must be a string",
                index + 1
            ))),
            (ScalarValue::Str(_), ScalarValueKind::Int) => Err(self.fault(format!(
                "argument {} of `{name}` must be an integer",
                index + 1
            ))),
            (value, _) => Ok(value),
        }
    }

    /// Pushes the frame of `entry`, or leaves it pending if its function has
    /// not been validated yet.
    fn enter(&mut self, entry: EraPendingEntry) -> EraVmResult<EraStep> {
        let program = self.program;
        let target = entry.frame.label;
        let Some(label) = program.func(target) else {
            return Err(self.internal(format!("line {} is not a function", target.0)));
        };
        if !label.checked {
            self.state.pending_entry = Some(entry);
            return Ok(EraStep::Validate(target));
        }
        if let Some(msg) = &label.error {
            return Err(self.fault(format!("function `{}` cannot run: {msg}", label.name)));
        }
        if self.state.frames.len() >= MAX_CALL_DEPTH {
            return Err(self.fault(format!(
                "probable infinite recursion: more than {MAX_CALL_DEPTH} active calls"
            )));
        }

        let EraPendingEntry { mut frame, args } = entry;
        frame.privates = self.fresh_privates(target)?;
        for (param, arg) in label.params.iter().zip(args) {
            match arg {
                EraBoundArg::Ref(cell) => {
                    frame.privates.insert(param.name.clone(), cell);
                }
                EraBoundArg::Value(value) => self.bind_param(&frame, param, value)?,
            }
        }
        self.state.frames.push(frame);
        self.state.cursor = Some(target.next());
        Ok(EraStep::Continue)
    }

    fn bind_param(&self, frame: &EraCallFrame, param: &EraVarRef, value: ScalarValue) -> EraVmResult<()> {
        let mut indices = Vec::with_capacity(param.indices.len());
        for index in &param.indices {
            let EraExpr::Int(x, _) = index else {
                return Err(self.internal(format!("parameter `{}` has a non-literal index", param.name)));
            };
            indices.push(*x);
        }
        let cell = match frame.privates.get(&param.name) {
            Some(cell) => cell.clone(),
            None => self
                .vars
                .resolve(frame.label, &param.name)
                .ok_or_else(|| self.internal(format!("parameter `{}` has no storage", param.name)))?,
        };
        let result = cell.borrow_mut().set(&indices, value);
        result.map_err(|e| self.fault(e))
    }

    fn fresh_privates(&self, target: EraLineId) -> EraVmResult<FxHashMap<ArcStr, EraVarCell>> {
        let mut out = FxHashMap::default();
        if let Some(func_vars) = self.vars.func(target) {
            for decl in func_vars.dynamic_decls() {
                let arr = EraVarArray::from_decl(decl).map_err(|e| self.internal(e))?;
                out.insert(decl.name.clone(), arr.into_cell());
            }
        }
        Ok(out)
    }

    /// Starts dispatching an event. Does nothing if it has no contributions.
    pub(crate) fn call_event(
        &mut self,
        name: &str,
        return_to: Option<EraLineId>,
        call_site: Option<EraLineId>,
        is_jump: bool,
    ) -> EraVmResult<EraStep> {
        let Some((cursor, first)) = self.first_contribution(name) else {
            return Ok(EraStep::Continue);
        };
        let mut frame = EraCallFrame::new(first);
        frame.event = Some(cursor);
        frame.return_to = return_to;
        frame.call_site = call_site;
        frame.is_jump = is_jump;
        self.enter(EraPendingEntry {
            frame,
            args: Vec::new(),
        })
    }

    /// Enters an ordinary function from the game flow or the host.
    pub(crate) fn call_root(&mut self, target: EraLineId) -> EraVmResult<EraStep> {
        self.enter(EraPendingEntry {
            frame: EraCallFrame::new(target),
            args: Vec::new(),
        })
    }

    fn first_contribution(&self, name: &str) -> Option<(EraEventCursor, EraLineId)> {
        let groups = self.labels.get_event(name)?;
        let name = ArcStr::from(name);
        if let Some(only) = groups.only() {
            let cursor = EraEventCursor {
                name,
                group: EVENT_GROUP_NORMAL,
                index: 0,
                is_only: true,
            };
            return Some((cursor, only));
        }
        self.find_contribution(name, 0, 0)
    }

    /// The contribution after `cursor`. With `skip_group`, the rest of the
    /// current group is passed over.
    fn next_contribution(
        &self,
        cursor: &EraEventCursor,
        skip_group: bool,
    ) -> Option<(EraEventCursor, EraLineId)> {
        if cursor.is_only {
            return None;
        }
        let (group, index) = if skip_group {
            (cursor.group + 1, 0)
        } else {
            (cursor.group, cursor.index + 1)
        };
        self.find_contribution(cursor.name.clone(), group, index)
    }

    fn find_contribution(
        &self,
        name: ArcStr,
        mut group: usize,
        mut index: usize,
    ) -> Option<(EraEventCursor, EraLineId)> {
        let groups = self.labels.get_event(&name)?;
        while group < EVENT_GROUP_COUNT {
            if let Some(&id) = groups.group(group).get(index) {
                let cursor = EraEventCursor {
                    name,
                    group,
                    index,
                    is_only: false,
                };
                return Some((cursor, id));
            }
            group += 1;
            index = 0;
        }
        None
    }

    /// Returns from the top frame. Event dispatch moves on to the next
    /// contribution instead of popping.
    fn do_return(&mut self, value: Option<ScalarValue>) -> EraVmResult<EraStep> {
        loop {
            if self.state.frames.len() <= self.state.floor {
                return Err(self.internal("return without an active frame"));
            }
            let Some(frame) = self.state.frames.last() else {
                return Err(self.internal("return without an active frame"));
            };
            if frame.is_method {
                let kind = self
                    .program
                    .func(frame.label)
                    .and_then(|x| x.method_kind)
                    .unwrap_or(ScalarValueKind::Int);
                self.state.method_result =
                    Some(value.unwrap_or_else(|| ScalarValue::default_of(kind)));
                self.state.frames.pop();
                return Ok(EraStep::Continue);
            }
            if let (false, Some(event)) = (frame.is_jump, &frame.event) {
                let handled = value.as_ref().is_some_and(|x| x.is_truthy())
                    && self
                        .program
                        .func(frame.label)
                        .is_some_and(|x| x.flags.contains(EraFuncFlags::IS_SINGLE));
                if let Some((cursor, next)) = self.next_contribution(event, handled) {
                    return self.restart_event_frame(cursor, next);
                }
            }
            let Some(frame) = self.state.frames.pop() else {
                return Err(self.internal("return without an active frame"));
            };
            if frame.is_jump {
                continue;
            }
            self.state.cursor = frame.return_to;
            return Ok(EraStep::Continue);
        }
    }

    fn restart_event_frame(&mut self, cursor: EraEventCursor, next: EraLineId) -> EraVmResult<EraStep> {
        let program = self.program;
        let Some(label) = program.func(next) else {
            return Err(self.internal(format!("line {} is not a function", next.0)));
        };
        if !label.checked {
            return Err(self.internal(format!("event `{}` was not validated", label.name)));
        }
        if let Some(msg) = &label.error {
            return Err(self.fault(format!("function `{}` cannot run: {msg}", label.name)));
        }
        let privates = self.fresh_privates(next)?;
        let Some(frame) = self.state.frames.last_mut() else {
            return Err(self.internal("event dispatch lost its frame"));
        };
        frame.label = next;
        frame.event = Some(cursor);
        frame.privates = privates;
        self.state.cursor = Some(next.next());
        Ok(EraStep::Continue)
    }

    /// Runs a value-returning function to completion from inside an
    /// expression.
    fn call_method(&mut self, target: EraLineId, args: &[Option<EraExpr>]) -> EraVmResult<ScalarValue> {
        if self.eval_depth >= MAX_EVAL_CALL_DEPTH {
            return Err(self.fault(format!(
                "probable infinite recursion: more than {MAX_EVAL_CALL_DEPTH} nested function calls"
            )));
        }
        let args = self.convert_args(target, args)?;
        let saved_site = self.site;
        let guard = self.state.enter_floor();
        self.state.method_result = None;

        let mut frame = EraCallFrame::new(target);
        frame.is_method = true;
        frame.call_site = self.site;
        let step = match self.enter(EraPendingEntry { frame, args })? {
            EraStep::Continue => {
                self.eval_depth += 1;
                let result = stacker::maybe_grow(STACK_RED_ZONE, STACK_GROWTH, || self.run_nested());
                self.eval_depth -= 1;
                result?
            }
            step => step,
        };
        self.site = saved_site;
        match step {
            EraStep::Continue => (),
            EraStep::Validate(_) => {
                return Err(self.internal("a #FUNCTION was called before validation"))
            }
            EraStep::Break(reason) => {
                return Err(self.fault(format!("a #FUNCTION cannot suspend execution ({reason})")))
            }
        }
        self.state.leave_floor(guard);

        let kind = self
            .program
            .func(target)
            .and_then(|x| x.method_kind)
            .unwrap_or(ScalarValueKind::Int);
        Ok(self
            .state
            .method_result
            .take()
            .unwrap_or_else(|| ScalarValue::default_of(kind)))
    }

    // ----- Expressions -----

    pub fn eval(&mut self, expr: &EraExpr) -> EraVmResult<ScalarValue> {
        Ok(match expr {
            EraExpr::Int(x, _) => ScalarValue::Int(*x),
            EraExpr::Str(x, _) => ScalarValue::Str(x.to_string()),
            EraExpr::Form(form, _) => ScalarValue::Str(self.eval_form(form)?),
            EraExpr::Var(var) => self.read_var(var)?,
            EraExpr::Call { name, args, .. } => self.eval_call(name, args)?,
            EraExpr::Unary { op, operand, .. } => {
                let value = self.eval(operand)?;
                apply_unary(*op, value).map_err(|e| self.fault(e))?
            }
            EraExpr::Binary { op, lhs, rhs, .. } => {
                let lhs = self.eval(lhs)?;
                match (op, lhs.as_int()) {
                    (EraBinaryOp::And, Some(0)) => return Ok(ScalarValue::Int(0)),
                    (EraBinaryOp::Or, Some(x)) if x != 0 => return Ok(ScalarValue::Int(1)),
                    _ => (),
                }
                let rhs = self.eval(rhs)?;
                apply_binary(*op, lhs, rhs).map_err(|e| self.fault(e))?
            }
            EraExpr::Ternary {
                cond,
                then,
                otherwise,
                ..
            } => {
                if self.eval(cond)?.is_truthy() {
                    self.eval(then)?
                } else {
                    self.eval(otherwise)?
                }
            }
        })
    }

    fn eval_call(&mut self, name: &str, args: &[Option<EraExpr>]) -> EraVmResult<ScalarValue> {
        if !is_builtin_method(name) {
            let target = self
                .labels
                .get_func(name)
                .filter(|&x| self.program.func(x).is_some_and(|x| x.is_method()));
            return match target {
                Some(target) => self.call_method(target, args),
                None => Err(self.fault(format!("`{name}` cannot be called in an expression"))),
            };
        }
        let mut values = Vec::with_capacity(args.len());
        for arg in args {
            values.push(match arg {
                Some(arg) => self.eval(arg)?,
                None => ScalarValue::Empty,
            });
        }
        let callback = &mut *self.callback;
        let mut rand = || callback.on_get_rand();
        match call_builtin(name, &values, Some(&mut rand as &mut dyn FnMut() -> u64)) {
            Some(Ok(value)) => Ok(value),
            Some(Err(e)) => Err(self.fault(e)),
            None => Err(self.internal(format!("builtin `{name}` vanished"))),
        }
    }

    pub fn eval_form(&mut self, form: &EraFormString) -> EraVmResult<String> {
        let mut out = String::new();
        for part in &form.parts {
            match part {
                EraFormPart::Text(x) => out.push_str(x),
                EraFormPart::Expr {
                    expr,
                    width,
                    align_left,
                } => {
                    let value = self.eval(expr)?.to_string();
                    let width = match width {
                        Some(w) => Some(self.eval_int(w)?),
                        None => None,
                    };
                    out.push_str(&pad_text(value, width, *align_left));
                }
                EraFormPart::Ternary {
                    cond,
                    then,
                    otherwise,
                } => {
                    let branch = if self.eval(cond)?.is_truthy() {
                        then
                    } else {
                        otherwise
                    };
                    out.push_str(&self.eval_form(branch)?);
                }
            }
        }
        Ok(out)
    }

    fn eval_int(&mut self, expr: &EraExpr) -> EraVmResult<i64> {
        let value = self.eval(expr)?;
        self.as_int(&value)
    }

    fn as_int(&self, value: &ScalarValue) -> EraVmResult<i64> {
        value
            .coerce_as_int()
            .ok_or_else(|| self.fault(format!("expected an integer, found {}", value.kind())))
    }

    fn arg_text(&mut self, arg: &EraCmdArg) -> EraVmResult<String> {
        Ok(match arg {
            EraCmdArg::Empty => String::new(),
            EraCmdArg::Text(x) => x.to_string(),
            EraCmdArg::Form(form) => self.eval_form(form)?,
            EraCmdArg::Expr(x) => self.eval(x)?.to_string(),
            EraCmdArg::ExprList(list) => {
                let mut out = String::new();
                for x in list {
                    out.push_str(&self.eval(x)?.to_string());
                }
                out
            }
            _ => return Err(self.internal("argument cannot be printed")),
        })
    }

    // ----- Variables -----

    /// Frame privates first, then the function's own storage, then globals.
    fn var_cell(&self, name: &str) -> EraVmResult<EraVarCell> {
        let found = match self.state.frames.last() {
            Some(frame) => frame
                .privates
                .get(name)
                .cloned()
                .or_else(|| self.vars.resolve(frame.label, name)),
            None => self.vars.get_global(name).cloned(),
        };
        found.ok_or_else(|| self.fault(format!("undefined variable `{name}`")))
    }

    fn indices_of(&mut self, var: &EraVarRef) -> EraVmResult<Vec<i64>> {
        let mut out = Vec::with_capacity(var.indices.len());
        for index in &var.indices {
            out.push(self.eval_int(index)?);
        }
        Ok(out)
    }

    fn read_var(&mut self, var: &EraVarRef) -> EraVmResult<ScalarValue> {
        let indices = self.indices_of(var)?;
        let cell = self.var_cell(&var.name)?;
        let value = cell.borrow().get(&indices);
        value.map_err(|e| self.fault(format!("`{}`: {e}", var.name)))
    }

    fn write_var(&mut self, var: &EraVarRef, value: ScalarValue) -> EraVmResult<()> {
        let indices = self.indices_of(var)?;
        let cell = self.var_cell(&var.name)?;
        let result = cell.borrow_mut().set(&indices, value);
        result.map_err(|e| self.fault(format!("`{}`: {e}", var.name)))
    }

    fn global(&self, name: &str) -> EraVmResult<&'a EraVarCell> {
        let vars = self.vars;
        vars.get_global(name)
            .ok_or_else(|| self.internal(format!("builtin variable `{name}` is missing")))
    }

    pub(crate) fn global_int(&self, name: &str, index: i64) -> EraVmResult<i64> {
        let value = self.global(name)?.borrow().get(&[index]);
        let value = value.map_err(|e| self.fault(format!("`{name}`: {e}")))?;
        self.as_int(&value)
    }

    pub(crate) fn global_str(&self, name: &str, index: i64) -> EraVmResult<String> {
        let value = self.global(name)?.borrow().get(&[index]);
        let value = value.map_err(|e| self.fault(format!("`{name}`: {e}")))?;
        Ok(value.to_string())
    }

    pub(crate) fn set_global(&self, name: &str, index: i64, value: ScalarValue) -> EraVmResult<()> {
        let result = self.global(name)?.borrow_mut().set(&[index], value);
        result.map_err(|e| self.fault(format!("`{name}`: {e}")))
    }

    // ----- Helpers -----

    /// A linked line of the current block. A branch that failed validation
    /// faults at its own position.
    fn inst_at(&self, id: EraLineId) -> EraVmResult<&'a EraInstruction> {
        let program = self.program;
        match program.get(id).map(|x| &x.kind) {
            Some(EraLineKind::Instruction(inst)) => match &inst.error {
                Some(msg) => Err(self.fault_of(EraFaultKind::Scripted, msg.clone(), Some(id))),
                None => Ok(&**inst),
            },
            _ => Err(self.internal(format!("line {} is not an instruction", id.0))),
        }
    }

    fn link(&self, inst: &EraInstruction) -> EraVmResult<EraLineId> {
        inst.jump_to
            .ok_or_else(|| self.internal(format!("{} is not linked to its block", inst.cmd)))
    }

    fn expr_arg<'x>(&self, cmd: EraCmd, arg: &'x EraCmdArg) -> EraVmResult<&'x EraExpr> {
        arg.as_expr().ok_or_else(|| self.bad_arg(cmd))
    }

    fn current_func(&self) -> EraVmResult<EraLineId> {
        self.site
            .and_then(|x| self.program.get(x))
            .map(|x| x.func)
            .ok_or_else(|| self.internal("no current function"))
    }

    fn bad_arg(&self, cmd: EraCmd) -> Box<EraRuntimeError> {
        self.internal(format!("malformed argument for {cmd}"))
    }

    pub(crate) fn fault(&self, msg: impl Into<String>) -> Box<EraRuntimeError> {
        self.fault_of(EraFaultKind::Scripted, msg.into(), self.site)
    }

    pub(crate) fn internal(&self, msg: impl Into<String>) -> Box<EraRuntimeError> {
        self.fault_of(EraFaultKind::Internal, msg.into(), self.site)
    }

    pub(crate) fn host_fault(&self, msg: impl Into<String>) -> Box<EraRuntimeError> {
        self.fault_of(EraFaultKind::Host, msg.into(), self.site)
    }

    fn fault_of(&self, kind: EraFaultKind, msg: String, site: Option<EraLineId>) -> Box<EraRuntimeError> {
        let call_chain = self
            .state
            .frames
            .iter()
            .rev()
            .filter_map(|x| x.call_site)
            .map(|x| self.call_site_of(Some(x)))
            .collect();
        Box::new(EraRuntimeError {
            kind,
            msg,
            site: self.call_site_of(site),
            call_chain,
        })
    }

    pub(crate) fn call_site_of(&self, id: Option<EraLineId>) -> EraCallSite {
        match id.and_then(|x| self.program.get(x)) {
            Some(line) => EraCallSite {
                func_name: self
                    .program
                    .func(line.func)
                    .map(|x| x.name.clone())
                    .unwrap_or_default(),
                filename: line.filename.clone(),
                loc: line.loc,
            },
            None => EraCallSite {
                func_name: arcstr::literal!("<flow>"),
                filename: ArcStr::new(),
                loc: SrcLoc::default(),
            },
        }
    }
}

fn for_continues(value: i64, end: i64, step: i64) -> bool {
    if step < 0 {
        value > end
    } else {
        value < end
    }
}

#[cfg(test)]
mod tests {
    use indoc::indoc;

    use super::*;
    use crate::{
        expr::EraExprCtx,
        loader::EraScriptLoader,
        validate::{EraValidateOptions, EraValidator},
        vars::EraLocalSizes,
    };

    #[derive(Default)]
    struct MockCallback {
        output: String,
        errors: Vec<EraRuntimeError>,
        rand: u64,
    }

    impl EraCompilerCallback for MockCallback {
        fn emit_diag(&mut self, _diag: Diagnostic) {}
        fn on_get_rand(&mut self) -> u64 {
            self.rand
        }
        fn on_print(&mut self, content: &str, flags: EraPrintExtendedFlags) {
            self.output.push_str(content);
            if flags.is_line() {
                self.output.push('\n');
            }
        }
        fn on_debugprint(&mut self, content: &str, _flags: EraPrintExtendedFlags) {
            self.output.push_str(content);
        }
        fn on_wait(&mut self, _any_key: bool, _is_force: bool) {}
        fn on_runtime_error(&mut self, error: &EraRuntimeError) {
            self.errors.push(error.clone());
        }
        fn on_get_save_info(&mut self, _slot: i64) -> Option<String> {
            None
        }
        fn on_save_game(&mut self, _slot: i64, _info: &str) -> anyhow::Result<()> {
            Ok(())
        }
        fn on_load_game(&mut self, _slot: i64) -> anyhow::Result<bool> {
            Ok(false)
        }
        fn on_watchdog(&mut self, _idle_ms: u64) -> bool {
            false
        }
    }

    struct Fixture {
        program: EraProgram,
        labels: EraLabelDirectory,
        vars: EraVarPool,
        state: EraProcessState,
        callback: MockCallback,
        opts: EraVmOptions,
    }

    impl Fixture {
        fn new(src: &str) -> Self {
            let defines = EraDefineScope::new();
            let mut vars = EraVarPool::new();
            let mut diag = Diagnostic::new();
            let mut loader = EraScriptLoader::new(false, true);
            loader.load_file(arcstr::literal!("TEST.ERB"), src, &defines, &vars, &mut diag);
            let sizes = EraLocalSizes {
                local: 10,
                locals: 10,
                arg: 10,
                args: 10,
            };
            let (mut program, labels) = loader.finish(&mut vars, sizes, &mut diag);
            let ctx = EraExprCtx::new(Some(&defines), true);
            let opts = EraValidateOptions {
                analysis_mode: true,
                ..Default::default()
            };
            EraValidator::new(&mut program, &labels, &vars, ctx, opts).validate_all(&mut diag);
            assert!(!diag.has_error(), "{:?}", diag.entries());
            Fixture {
                program,
                labels,
                vars,
                state: EraProcessState::new(),
                callback: MockCallback::default(),
                opts: EraVmOptions {
                    ignore_case: true,
                    ..Default::default()
                },
            }
        }

        /// Calls `name` and runs it to completion.
        fn call(&mut self, name: &str) -> EraVmResult<EraStep> {
            let flag = AtomicBool::new(true);
            let target = self.labels.get_func(name).expect("function exists");
            let mut vm = EraVm::new(
                &self.program,
                &self.labels,
                &self.vars,
                &mut self.state,
                &mut self.callback,
                self.opts,
                &flag,
            );
            let guard = vm.state.enter_floor();
            let step = vm.call_root(target)?;
            assert_eq!(step, EraStep::Continue);
            let step = vm.run_nested()?;
            vm.state.leave_floor(guard);
            Ok(step)
        }

        fn int(&self, name: &str, index: i64) -> i64 {
            let cell = self.vars.get_global(name).expect("global");
            let value = cell.borrow().get(&[index]).expect("in range");
            value.as_int().expect("integer")
        }
    }

    #[test]
    fn loops_and_branches() -> anyhow::Result<()> {
        let mut fx = Fixture::new(indoc! {"
            @MAIN
                A = 0
                REPEAT 5
                    SIF COUNT == 3
                        CONTINUE
                    A += COUNT
                REND
                FOR B, 10, 0, -3
                    C += 1
                NEXT
                WHILE 1
                    D += 1
                    IF D >= 4
                        BREAK
                    ELSEIF D == 2
                        E = 100
                    ELSE
                        E += 1
                    ENDIF
                WEND
                DO
                    F += 2
                LOOP F < 7
                SELECTCASE F
                    CASE 1, 2
                        G = 1
                    CASE 7 TO 9
                        G = 2
                    CASEELSE
                        G = 3
                ENDSELECT
        "});
        assert_eq!(fx.call("MAIN").map_err(|e| anyhow::anyhow!("{e}"))?, EraStep::Continue);
        assert_eq!(fx.int("A", 0), 0 + 1 + 2 + 4);
        assert_eq!(fx.int("C", 0), 4);
        assert_eq!(fx.int("D", 0), 4);
        assert_eq!(fx.int("E", 0), 101);
        assert_eq!(fx.int("F", 0), 8);
        assert_eq!(fx.int("G", 0), 2);
        Ok(())
    }

    #[test]
    fn calls_bind_arguments_and_methods_return() -> anyhow::Result<()> {
        let mut fx = Fixture::new(indoc! {"
            @MAIN
                CALL ADD(2, 3)
                A = RESULT
                B = TWICE(21)
                CALL BUMP(C)
                CALL BUMP(C)
                PRINTFORML {A} {B} {C}
            @ADD(X, Y = 10)
                RETURN X + Y
            @TWICE(X)
            #FUNCTION
                RETURNF X * 2
            @BUMP(V)
            #DIM REF V
                V += 1
        "});
        fx.call("MAIN").map_err(|e| anyhow::anyhow!("{e}"))?;
        assert_eq!(fx.callback.output, "5 42 2\n");
        assert!(fx.state.frames().is_empty());
        Ok(())
    }

    #[test]
    fn data_blocks_pick_by_rand() -> anyhow::Result<()> {
        let mut fx = Fixture::new(indoc! {"
            @MAIN
                PRINTDATAL
                    DATA first
                    DATALIST
                        DATA second
                        DATAFORM {1 + 1}
                    ENDLIST
                ENDDATA
                STRDATA
                    DATA only
                ENDDATA
                PRINTS RESULTS
        "});
        fx.callback.rand = 1;
        fx.call("MAIN").map_err(|e| anyhow::anyhow!("{e}"))?;
        assert_eq!(fx.callback.output, "second\n2\nonly");
        Ok(())
    }

    #[test]
    fn faults_carry_the_call_chain() {
        let mut fx = Fixture::new(indoc! {"
            @MAIN
                CALL MIDDLE
            @MIDDLE
                PRINTL before
                THROW broke {1 + 1}
        "});
        let err = fx.call("MAIN").expect_err("throws");
        assert_eq!(err.kind, EraFaultKind::Scripted);
        assert_eq!(err.msg, "broke 2");
        assert_eq!(err.site.func_name.as_str(), "MIDDLE");
        assert_eq!(err.site.loc.line, 5);
        assert_eq!(err.call_chain.len(), 1);
        assert_eq!(err.call_chain[0].func_name.as_str(), "MAIN");
        assert_eq!(err.call_chain[0].loc.line, 2);
    }

    #[test]
    fn recursion_is_capped() {
        let mut fx = Fixture::new(indoc! {"
            @MAIN
                A = LOOPY(0)
            @LOOPY(X)
            #FUNCTION
                RETURNF LOOPY(X + 1)
            @DEEP
                CALL DEEP
        "});
        let err = fx.call("MAIN").expect_err("method recursion");
        assert!(err.msg.starts_with("probable infinite recursion"), "{}", err.msg);
        assert!(err.msg.contains(&MAX_EVAL_CALL_DEPTH.to_string()));

        fx.state = EraProcessState::new();
        let err = fx.call("DEEP").expect_err("call recursion");
        assert!(err.msg.contains(&MAX_CALL_DEPTH.to_string()), "{}", err.msg);
    }

    #[test]
    fn jump_returns_past_the_jumping_function() -> anyhow::Result<()> {
        let mut fx = Fixture::new(indoc! {"
            @MAIN
                CALL OUTER
                PRINTL back
            @OUTER
                PRINTL outer
                JUMP INNER(7)
                PRINTL unreachable
            @INNER(X)
                PRINTFORML inner {X}
        "});
        fx.call("MAIN").map_err(|e| anyhow::anyhow!("{e}"))?;
        assert_eq!(fx.callback.output, "outer\ninner 7\nback\n");
        assert!(fx.state.frames().is_empty());
        Ok(())
    }

    #[test]
    fn catch_blocks_run_only_for_missing_targets() -> anyhow::Result<()> {
        let mut fx = Fixture::new(indoc! {"
            @MAIN
                TRYCALL NOWHERE
                TRYCCALL NOWHERE
                    PRINTL skipped
                CATCH
                    PRINTL caught
                ENDCATCH
                TRYCCALL HELPER
                CATCH
                    PRINTL not caught
                ENDCATCH
                PRINTL found
                TRYCJUMP GONE
                CATCH
                    PRINTL jump caught
                ENDCATCH
            @HELPER
                PRINTL helper
        "});
        fx.call("MAIN").map_err(|e| anyhow::anyhow!("{e}"))?;
        assert_eq!(fx.callback.output, "caught\nhelper\nfound\njump caught\n");
        Ok(())
    }

    #[test]
    fn reference_arguments_must_fit() {
        let src = indoc! {"
            @WRONG_KIND
                CALL TAKE(STR)
            @NOT_A_VAR
                CALL TAKE(1 + 2)
            @TAKE(V)
            #DIM REF V
                V += 1
        "};
        let mut fx = Fixture::new(src);
        let err = fx.call("WRONG_KIND").expect_err("string array into int ref");
        assert!(err.msg.contains("does not match the reference's type or shape"), "{}", err.msg);

        fx.state = EraProcessState::new();
        let err = fx.call("NOT_A_VAR").expect_err("expression into ref");
        assert!(err.msg.contains("is a reference and needs a variable"), "{}", err.msg);
    }

    #[test]
    fn integers_reach_string_parameters_only_in_compat_mode() -> anyhow::Result<()> {
        let src = indoc! {"
            @MAIN
                CALL SHOW(42)
            @SHOW(ARGS)
                PRINTSL ARGS
        "};
        let mut fx = Fixture::new(src);
        let err = fx.call("MAIN").expect_err("int into string parameter");
        assert_eq!(err.msg, "argument 1 of `SHOW` must be a string");
        assert!(fx.callback.output.is_empty());

        let mut fx = Fixture::new(src);
        fx.opts.compat_int_to_str_args = true;
        fx.call("MAIN").map_err(|e| anyhow::anyhow!("{e}"))?;
        assert_eq!(fx.callback.output, "42\n");
        Ok(())
    }

    #[test]
    fn input_suspends_until_delivered() -> anyhow::Result<()> {
        let mut fx = Fixture::new(indoc! {"
            @MAIN
                INPUT
                PRINTFORML got {RESULT}
        "});
        let step = fx.call("MAIN").map_err(|e| anyhow::anyhow!("{e}"))?;
        assert_eq!(step, EraStep::Break(EraExecutionBreakReason::WaitingForInput));
        assert!(fx.callback.output.is_empty());
        Ok(())
    }
}
