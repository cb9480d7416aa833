use std::{borrow::Cow, sync::atomic::AtomicBool};

use arcstr::ArcStr;
use enumset::EnumSet;
use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::{
    expr::EraExprCtx,
    flow::EraPhase,
    header::EraHeaderLoader,
    labels::EraLabelDirectory,
    lexer::normalize_ident,
    line::{EraLineId, EraProgram},
    loader::EraScriptLoader,
    process::EraProcessState,
    types::*,
    validate::{EraUnreferencedPolicy, EraValidateOptions, EraValidator},
    vars::{EraLocalSizes, EraVarPool},
    vm::{EraStep, EraVm, EraVmOptions},
};

#[derive(thiserror::Error, Debug, Serialize, Deserialize)]
#[error("{msg}")]
pub struct MEraEngineError {
    pub msg: String,
}
impl MEraEngineError {
    pub fn new(msg: String) -> Self {
        MEraEngineError { msg }
    }
}
impl From<anyhow::Error> for MEraEngineError {
    fn from(value: anyhow::Error) -> Self {
        Self::new(value.to_string())
    }
}
impl From<String> for MEraEngineError {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}
impl From<MEraEngineError> for String {
    fn from(value: MEraEngineError) -> Self {
        value.msg
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MEraEngineConfig {
    /// Whether `[IF_DEBUG]` blocks are active and `DEBUGPRINT` prints.
    pub enable_debug: bool,
    /// Whether identifiers are compared case-insensitively.
    pub ignore_case: bool,
    /// Parses the arguments of every function up front instead of only the
    /// reachable ones. Surfaces syntax errors in dead code.
    pub eager_arg_parse: bool,
    /// Validates every function regardless of reachability. Meant for
    /// analysing a script set without running it.
    pub analysis_mode: bool,
    /// How functions that are never called are reported.
    pub unreferenced_policy: EraUnreferencedPolicy,
    /// Lets an event function be called by name like an ordinary one.
    pub compat_call_event_as_function: bool,
    /// Lets an ordinary function stand in where an event is dispatched.
    pub compat_call_function_as_event: bool,
    /// Lets a call with no arguments at all fall back to parameter defaults.
    pub compat_optional_args: bool,
    /// Converts integer arguments to strings for string parameters.
    pub compat_int_to_str_args: bool,
    /// Warnings below this level are not displayed.
    pub display_warn_level: u8,
    /// Warnings at or above this level are treated as errors.
    pub fatal_warn_level: u8,
    /// Diagnostic categories that are dropped entirely.
    pub ignored_diag_categories: EnumSet<EraDiagCategory>,
    /// Diagnostic categories shown once per file.
    pub display_once_diag_categories: EnumSet<EraDiagCategory>,
    /// Idle time without a phase change before the host is asked whether to
    /// abort. 0 disables the watchdog.
    pub watchdog_timeout_ms: u64,
    /// Size of `LOCAL` in functions without `#LOCALSIZE`.
    pub default_local_size: u32,
    /// Size of `LOCALS` in functions without `#LOCALSSIZE`.
    pub default_locals_size: u32,
    /// Size of `ARG` in every function.
    pub default_arg_size: u32,
    /// Size of `ARGS` in every function.
    pub default_args_size: u32,
}
impl Default for MEraEngineConfig {
    fn default() -> Self {
        MEraEngineConfig {
            enable_debug: false,
            ignore_case: true,
            eager_arg_parse: false,
            analysis_mode: false,
            unreferenced_policy: EraUnreferencedPolicy::Display,
            compat_call_event_as_function: false,
            compat_call_function_as_event: false,
            compat_optional_args: false,
            compat_int_to_str_args: false,
            display_warn_level: 1,
            fatal_warn_level: u8::MAX,
            ignored_diag_categories: EnumSet::empty(),
            display_once_diag_categories: EnumSet::empty(),
            watchdog_timeout_ms: 0,
            default_local_size: 1000,
            default_locals_size: 100,
            default_arg_size: 1000,
            default_args_size: 100,
        }
    }
}

impl MEraEngineConfig {
    /// Reads a config from JSON. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self, MEraEngineError> {
        serde_json::from_str(json)
            .map_err(|e| MEraEngineError::new(format!("invalid engine config: {e}")))
    }

    fn diag_filter(&self) -> EraDiagFilter {
        EraDiagFilter {
            ignored: self.ignored_diag_categories,
            display_once: self.display_once_diag_categories,
            display_warn_level: self.display_warn_level,
            fatal_warn_level: self.fatal_warn_level,
        }
    }

    fn validate_options(&self) -> EraValidateOptions {
        EraValidateOptions {
            eager_arg_parse: self.eager_arg_parse,
            analysis_mode: self.analysis_mode,
            compat_call_event_as_function: self.compat_call_event_as_function,
            unreferenced_policy: self.unreferenced_policy,
        }
    }

    fn vm_options(&self) -> EraVmOptions {
        EraVmOptions {
            enable_debug: self.enable_debug,
            ignore_case: self.ignore_case,
            compat_call_event_as_function: self.compat_call_event_as_function,
            compat_call_function_as_event: self.compat_call_function_as_event,
            compat_optional_args: self.compat_optional_args,
            compat_int_to_str_args: self.compat_int_to_str_args,
            watchdog_timeout_ms: self.watchdog_timeout_ms,
        }
    }

    fn local_sizes(&self) -> EraLocalSizes {
        EraLocalSizes {
            local: self.default_local_size,
            locals: self.default_locals_size,
            arg: self.default_arg_size,
            args: self.default_args_size,
        }
    }
}

#[allow(unused_variables)]
pub trait MEraEngineSysCallback {
    /// Callback for load-time diagnostics, already filtered by the config.
    fn on_error(&mut self, diag: &Diagnostic) {}
    /// Callback for RAND and the data-block pickers. Note that you should
    /// always return a fully filled random u64.
    fn on_get_rand(&mut self) -> u64 {
        0
    }
    /// Callback for PRINT family statements and the built-in menus.
    fn on_print(&mut self, content: &str, flags: EraPrintExtendedFlags) {}
    /// Callback for DEBUGPRINT statements. Only called in debug mode.
    fn on_debugprint(&mut self, content: &str, flags: EraPrintExtendedFlags) {}
    fn on_wait(&mut self, any_key: bool, is_force: bool) {}
    /// Callback for runtime faults. Execution stops right after.
    fn on_runtime_error(&mut self, error: &EraRuntimeError) {}
    /// Short description of a save slot, or `None` if it is empty.
    fn on_get_save_info(&mut self, slot: i64) -> Option<String> {
        None
    }
    /// Persists the game into `slot`. `info` is the description set by
    /// `SAVEINFO`.
    fn on_save_game(&mut self, slot: i64, info: &str) -> anyhow::Result<()> {
        anyhow::bail!("saving is not supported by this host")
    }
    /// Restores the game from `slot`. Returns `false` if the slot is empty.
    fn on_load_game(&mut self, slot: i64) -> anyhow::Result<bool> {
        Ok(false)
    }
    /// Called when no phase change happened for `watchdog_timeout_ms`.
    /// Returning `true` aborts execution.
    fn on_watchdog(&mut self, idle_ms: u64) -> bool {
        false
    }
}

impl<T: MEraEngineSysCallback> EraCompilerCallback for T {
    fn emit_diag(&mut self, diag: Diagnostic) {
        self.on_error(&diag);
    }

    fn on_get_rand(&mut self) -> u64 {
        MEraEngineSysCallback::on_get_rand(self)
    }

    fn on_print(&mut self, content: &str, flags: EraPrintExtendedFlags) {
        MEraEngineSysCallback::on_print(self, content, flags)
    }

    fn on_debugprint(&mut self, content: &str, flags: EraPrintExtendedFlags) {
        MEraEngineSysCallback::on_debugprint(self, content, flags)
    }

    fn on_wait(&mut self, any_key: bool, is_force: bool) {
        MEraEngineSysCallback::on_wait(self, any_key, is_force)
    }

    fn on_runtime_error(&mut self, error: &EraRuntimeError) {
        MEraEngineSysCallback::on_runtime_error(self, error)
    }

    fn on_get_save_info(&mut self, slot: i64) -> Option<String> {
        MEraEngineSysCallback::on_get_save_info(self, slot)
    }

    fn on_save_game(&mut self, slot: i64, info: &str) -> anyhow::Result<()> {
        MEraEngineSysCallback::on_save_game(self, slot, info)
    }

    fn on_load_game(&mut self, slot: i64) -> anyhow::Result<bool> {
        MEraEngineSysCallback::on_load_game(self, slot)
    }

    fn on_watchdog(&mut self, idle_ms: u64) -> bool {
        MEraEngineSysCallback::on_watchdog(self, idle_ms)
    }
}

pub struct EmptyCallback;
impl MEraEngineSysCallback for EmptyCallback {}

/// Routes filtered diagnostics to the host.
struct EraHostDiagnostics<'a, T>(&'a mut T);

impl<T: EraCompilerCallback> EraEmitDiagnostic for EraHostDiagnostics<'_, T> {
    fn emit_diag(&mut self, diag: Diagnostic) {
        self.0.emit_diag(diag);
    }
}

fn emit_to_host<T: EraCompilerCallback>(
    sink: &mut EraDiagnosticSink,
    callback: &mut T,
    diag: Diagnostic,
) -> bool {
    if diag.is_empty() {
        return false;
    }
    sink.emit(diag, &mut EraHostDiagnostics(callback))
}

/// Strips a UTF-8 BOM and decodes, replacing invalid sequences.
fn decode_source(content: &[u8]) -> Cow<'_, str> {
    let content = content
        .strip_prefix("\u{feff}".as_bytes())
        .unwrap_or(content);
    simdutf8::basic::from_utf8(content).map_or_else(|_| String::from_utf8_lossy(content), Cow::Borrowed)
}

/// Collects declaration and script files, then builds a runnable engine.
/// Declaration files must all be loaded before the first script file.
pub struct MEraEngineBuilder<T> {
    callback: T,
    config: MEraEngineConfig,
    sink: EraDiagnosticSink,
    header: Option<EraHeaderLoader>,
    loader: Option<EraScriptLoader>,
    defines: EraDefineScope,
    vars: EraVarPool,
    /// Whether the headers have been resolved.
    is_header_finished: bool,
    erh_count: usize,
    erb_count: usize,
}

impl<T: MEraEngineSysCallback> MEraEngineBuilder<T> {
    pub fn new(callback: T) -> Self {
        let config = MEraEngineConfig::default();
        MEraEngineBuilder {
            callback,
            sink: EraDiagnosticSink::new(config.diag_filter()),
            config,
            header: None,
            loader: None,
            defines: EraDefineScope::new(),
            vars: EraVarPool::new(),
            is_header_finished: false,
            erh_count: 0,
            erb_count: 0,
        }
    }

    /// Replaces the config. Must be called before any file is loaded.
    pub fn with_config(mut self, config: MEraEngineConfig) -> Self {
        let loaded = self.erh_count + self.erb_count;
        if loaded > 0 {
            warn!("engine config changed after {loaded} file(s) were loaded");
        }
        self.sink = EraDiagnosticSink::new(config.diag_filter());
        self.config = config;
        self
    }

    pub fn get_config(&self) -> &MEraEngineConfig {
        &self.config
    }

    pub fn load_erh(&mut self, filename: &str, content: &[u8]) -> Result<(), MEraEngineError> {
        if self.is_header_finished {
            return Err(MEraEngineError::new(format!(
                "cannot load `{filename}`: headers are already finished"
            )));
        }
        let content = decode_source(content);
        let filename = ArcStr::from(filename);
        let (is_debug, ignore_case) = (self.config.enable_debug, self.config.ignore_case);
        let header = self
            .header
            .get_or_insert_with(|| EraHeaderLoader::new(is_debug, ignore_case));
        let mut diag = Diagnostic::with_file(filename.clone());
        header.load_file(filename, &content, &mut diag);
        emit_to_host(&mut self.sink, &mut self.callback, diag);
        self.erh_count += 1;
        Ok(())
    }

    /// Resolves every declaration loaded so far. Called implicitly by the
    /// first `load_erb` and by `build`.
    pub fn finish_load_erh(&mut self) -> Result<(), MEraEngineError> {
        if self.is_header_finished {
            return Ok(());
        }

        self.is_header_finished = true;

        let Some(mut header) = self.header.take() else {
            return Ok(());
        };
        let pending = header.pending_count();
        let mut diag = Diagnostic::new();
        let resolved = header.finish(&mut self.vars, &mut diag);
        emit_to_host(&mut self.sink, &mut self.callback, diag);
        self.defines = header.into_defines();
        debug!(
            "headers finished: {} file(s), {pending} declaration(s), {} define(s)",
            self.erh_count,
            self.defines.len()
        );
        if !resolved {
            return Err(MEraEngineError::new(
                "some header declarations could not be resolved".to_owned(),
            ));
        }
        Ok(())
    }

    pub fn load_erb(&mut self, filename: &str, content: &[u8]) -> Result<(), MEraEngineError> {
        self.finish_load_erh()?;

        let content = decode_source(content);
        let filename = ArcStr::from(filename);
        let (is_debug, ignore_case) = (self.config.enable_debug, self.config.ignore_case);
        let loader = self
            .loader
            .get_or_insert_with(|| EraScriptLoader::new(is_debug, ignore_case));
        let mut diag = Diagnostic::with_file(filename.clone());
        loader.load_file(filename, &content, &self.defines, &self.vars, &mut diag);
        emit_to_host(&mut self.sink, &mut self.callback, diag);
        self.erb_count += 1;
        Ok(())
    }

    /// Lays out the program, validates it and returns the engine. Errors in
    /// individual lines are reported but do not fail the build; the lines
    /// fault when executed.
    pub fn build(mut self) -> Result<MEraEngine<T>, MEraEngineError> {
        self.finish_load_erh()?;

        let MEraEngineBuilder {
            mut callback,
            config,
            mut sink,
            loader,
            defines,
            mut vars,
            erb_count,
            ..
        } = self;
        let loader =
            loader.unwrap_or_else(|| EraScriptLoader::new(config.enable_debug, config.ignore_case));

        let mut diag = Diagnostic::new();
        let (mut program, labels) = loader.finish(&mut vars, config.local_sizes(), &mut diag);
        emit_to_host(&mut sink, &mut callback, diag);

        let mut diag = Diagnostic::new();
        let ctx = EraExprCtx::new(Some(&defines), config.ignore_case);
        let summary = EraValidator::new(&mut program, &labels, &vars, ctx, config.validate_options())
            .validate_all(&mut diag);
        emit_to_host(&mut sink, &mut callback, diag);
        if let Some(deferred) = summary.deferred {
            emit_to_host(&mut sink, &mut callback, deferred);
        }

        debug!(
            "engine built: {erb_count} script file(s), {} line(s), {} error(s), {} warning(s)",
            program.len(),
            sink.error_count(),
            sink.warning_count()
        );
        if sink.suppressed_count() > 0 {
            warn!("{} diagnostic(s) were suppressed", sink.suppressed_count());
        }

        Ok(MEraEngine {
            callback,
            config,
            sink,
            program,
            labels,
            defines,
            vars,
            state: EraProcessState::new(),
        })
    }
}

pub struct MEraEngine<T> {
    callback: T,
    config: MEraEngineConfig,
    sink: EraDiagnosticSink,
    program: EraProgram,
    labels: EraLabelDirectory,
    defines: EraDefineScope,
    vars: EraVarPool,
    state: EraProcessState,
}

impl<T> MEraEngine<T> {
    pub fn get_version() -> &'static str {
        concat!("MEraScriptCore v", env!("CARGO_PKG_VERSION"))
    }
}

impl<T: MEraEngineSysCallback> MEraEngine<T> {
    pub fn get_config(&self) -> &MEraEngineConfig {
        &self.config
    }

    pub fn callback(&self) -> &T {
        &self.callback
    }

    pub fn callback_mut(&mut self) -> &mut T {
        &mut self.callback
    }

    fn vm<'a>(&'a mut self, run_flag: &'a AtomicBool) -> EraVm<'a, T> {
        EraVm::new(
            &self.program,
            &self.labels,
            &self.vars,
            &mut self.state,
            &mut self.callback,
            self.config.vm_options(),
            run_flag,
        )
    }

    /// Validates a function skipped at build time, right before it is
    /// entered for the first time.
    fn validate_on_demand(&mut self, func: EraLineId) {
        let mut diag = Diagnostic::new();
        let ctx = EraExprCtx::new(Some(&self.defines), self.config.ignore_case);
        EraValidator::new(
            &mut self.program,
            &self.labels,
            &self.vars,
            ctx,
            self.config.validate_options(),
        )
        .validate_function(func, &mut diag);
        emit_to_host(&mut self.sink, &mut self.callback, diag);
    }

    /// Runs the game flow until it breaks, at most `max_inst_cnt` steps.
    /// Clearing `run_flag` from another thread stops it early.
    pub fn do_execution(
        &mut self,
        run_flag: &AtomicBool,
        max_inst_cnt: u64,
    ) -> Result<EraExecutionBreakReason, MEraEngineError> {
        let mut budget = max_inst_cnt;
        loop {
            let step = self.vm(run_flag).execute(&mut budget);
            match step {
                EraStep::Break(reason) => return Ok(reason),
                EraStep::Validate(func) => self.validate_on_demand(func),
                EraStep::Continue => {
                    return Err(MEraEngineError::new(
                        "execution stopped without a reason".to_owned(),
                    ))
                }
            }
        }
    }

    /// Delivers the value a waiting phase or `INPUT` asked for.
    pub fn push_input(&mut self, value: EraInputValue) -> Result<(), MEraEngineError> {
        Ok(self.state.push_input(value)?)
    }

    /// Runs an ordinary function to completion on top of the current state,
    /// e.g. `SAVEINFO` from a host menu.
    pub fn call_function(&mut self, name: &str) -> Result<(), MEraEngineError> {
        let name = normalize_ident(name, self.config.ignore_case);
        if self.labels.get_func(&name).is_none() {
            let allowed = self.config.compat_call_event_as_function && self.labels.is_event(&name);
            if self.labels.is_event(&name) && !allowed {
                return Err(MEraEngineError::new(format!(
                    "`{name}` is an event function and cannot be called as a function"
                )));
            }
            if !allowed {
                return Err(MEraEngineError::new(format!("function `{name}` does not exist")));
            }
        }

        let run_flag = AtomicBool::new(true);
        let guard = self.state.enter_floor();
        let floor = self.state.floor;
        let result = self.run_function(&name, &run_flag);
        if result.is_err() {
            self.state.unwind_to(floor);
        }
        self.state.leave_floor(guard);
        result
    }

    fn run_function(&mut self, name: &ArcStr, run_flag: &AtomicBool) -> Result<(), MEraEngineError> {
        let mut is_first = true;
        loop {
            let mut vm = self.vm(run_flag);
            let started = if std::mem::take(&mut is_first) {
                match vm.labels.get_func(name) {
                    Some(target) => vm.call_root(target),
                    None => vm.call_event(name, None, None, false),
                }
            } else {
                Ok(EraStep::Continue)
            };
            let step = match started {
                Ok(EraStep::Continue) => vm.run_nested(),
                other => other,
            };
            let step = match step {
                Ok(step) => step,
                Err(e) => {
                    let reason = vm.report_fault(*e);
                    return Err(MEraEngineError::new(format!("`{name}` failed: {reason}")));
                }
            };
            match step {
                EraStep::Continue => return Ok(()),
                EraStep::Validate(func) => self.validate_on_demand(func),
                EraStep::Break(reason) => {
                    return Err(MEraEngineError::new(format!(
                        "`{name}` did not run to completion: {reason}"
                    )))
                }
            }
        }
    }

    /// The line that executes next, if any frame is active.
    pub fn current_position(&self) -> Option<EraCallSite> {
        let line = self.program.get(self.state.cursor()?)?;
        Some(EraCallSite {
            func_name: self
                .program
                .func(line.func)
                .map(|x| x.name.clone())
                .unwrap_or_default(),
            filename: line.filename.clone(),
            loc: line.loc,
        })
    }

    /// Saves the call stack and phase, leaving an empty stack behind.
    pub fn push_process_snapshot(&mut self) {
        self.state.push_snapshot();
    }

    /// Restores the last saved call stack and phase.
    pub fn pop_process_snapshot(&mut self) -> bool {
        self.state.pop_snapshot()
    }

    pub fn current_phase(&self) -> EraPhase {
        self.state.phase()
    }

    pub fn label_directory(&self) -> &EraLabelDirectory {
        &self.labels
    }

    pub fn last_runtime_error(&self) -> Option<&EraRuntimeError> {
        self.state.last_error.as_ref()
    }

    fn get_var(&self, name: &str, index: &[i64]) -> Result<ScalarValue, MEraEngineError> {
        let name = normalize_ident(name, self.config.ignore_case);
        let Some(var) = self.vars.get_global(&name) else {
            return Err(MEraEngineError::new(format!("variable `{name}` does not exist")));
        };
        let value = var.borrow().get(index);
        value.map_err(|e| MEraEngineError::new(format!("`{name}`: {e}")))
    }

    pub fn get_int_var(&self, name: &str, index: &[i64]) -> Result<i64, MEraEngineError> {
        match self.get_var(name, index)? {
            ScalarValue::Int(x) => Ok(x),
            _ => Err(MEraEngineError::new(format!("`{name}` is not an integer variable"))),
        }
    }

    pub fn get_str_var(&self, name: &str, index: &[i64]) -> Result<String, MEraEngineError> {
        match self.get_var(name, index)? {
            ScalarValue::Str(x) => Ok(x),
            _ => Err(MEraEngineError::new(format!("`{name}` is not a string variable"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_reads_partial_json() -> anyhow::Result<()> {
        let config = MEraEngineConfig::from_json(
            r#"{
                "enable_debug": true,
                "unreferenced_policy": "Deferred",
                "ignored_diag_categories": ["Style", "Unreferenced"],
                "default_local_size": 16
            }"#,
        )?;
        assert!(config.enable_debug);
        assert!(config.ignore_case);
        assert_eq!(config.unreferenced_policy, EraUnreferencedPolicy::Deferred);
        assert!(config.ignored_diag_categories.contains(EraDiagCategory::Style));
        assert_eq!(config.local_sizes().local, 16);
        assert_eq!(config.local_sizes().arg, 1000);
        assert!(MEraEngineConfig::from_json("{\"ignore_case\": 3}").is_err());
        Ok(())
    }

    #[test]
    fn sources_are_decoded_leniently() {
        assert_eq!(decode_source(b"\xef\xbb\xbf@MAIN"), "@MAIN");
        assert_eq!(decode_source(b"A\xffB"), "A\u{fffd}B");
        assert!(matches!(decode_source(b"plain"), Cow::Borrowed(_)));
    }

    #[test]
    fn headers_close_before_scripts() -> anyhow::Result<()> {
        let mut builder = MEraEngineBuilder::new(EmptyCallback);
        builder.load_erh("A.ERH", b"#DIM CONST X = 1\n")?;
        builder.load_erb("A.ERB", b"@MAIN\nRETURN X\n")?;
        assert!(builder.load_erh("B.ERH", b"#DIM Y\n").is_err());
        let engine = builder.build()?;
        assert_eq!(engine.get_int_var("x", &[0])?, 1);
        assert!(engine.get_str_var("X", &[0]).is_err());
        assert!(engine.get_int_var("NOPE", &[0]).is_err());
        Ok(())
    }
}
