use std::fmt::Display;

use arcstr::ArcStr;
use enumset::{EnumSet, EnumSetType};
use hashbrown::{HashMap, HashSet};
use indexmap::IndexMap;
use rustc_hash::FxBuildHasher;
use serde::{Deserialize, Serialize};

pub(crate) type FxHashMap<K, V> = HashMap<K, V, FxBuildHasher>;
pub(crate) type FxHashSet<K> = HashSet<K, FxBuildHasher>;
pub(crate) type FxIndexMap<K, V> = IndexMap<K, V, FxBuildHasher>;

/// Byte offset into a source line.
#[repr(transparent)]
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct SrcPos(pub u32);

/// A byte range inside a single source line.
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct SrcSpan {
    start: SrcPos,
    len: u32,
}

impl SrcSpan {
    pub fn new(start: SrcPos, len: u32) -> SrcSpan {
        SrcSpan { start, len }
    }

    /// The smallest span holding both `a` and `b`.
    pub fn new_covering(a: SrcSpan, b: SrcSpan) -> SrcSpan {
        let start = a.start.min(b.start);
        let end = a.end().max(b.end());
        SrcSpan::new(start, end.0 - start.0)
    }

    pub fn start(&self) -> SrcPos {
        self.start
    }

    pub fn len(&self) -> u32 {
        self.len
    }

    pub fn end(&self) -> SrcPos {
        SrcPos(self.start.0 + self.len)
    }
}

/// Line and column of a diagnostic or call site. Lines count from 1,
/// columns from 0; `Display` shows both 1-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SrcLoc {
    pub line: u32,
    pub col: u32,
}

impl Default for SrcLoc {
    fn default() -> Self {
        SrcLoc::new(1, 0)
    }
}

impl SrcLoc {
    pub fn new(line: u32, col: u32) -> Self {
        SrcLoc { line, col }
    }

    /// Moves the column to where `span` starts, `span` being relative to
    /// this location.
    pub fn with_span(self, span: SrcSpan) -> Self {
        SrcLoc::new(self.line, self.col + span.start().0)
    }
}

impl Display for SrcLoc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.line, self.col + 1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, Serialize, Deserialize)]
#[strum(serialize_all = "lowercase")]
pub enum DiagnosticLevel {
    Error,
    Warning,
    Note,
}

/// Coarse grouping of diagnostics, used for ignore switches and throttling.
#[derive(Debug, Default, EnumSetType, Hash, strum::Display, Serialize, Deserialize)]
#[enumset(serialize_repr = "list")]
pub enum EraDiagCategory {
    #[default]
    General,
    Preprocess,
    Macro,
    Header,
    Label,
    Syntax,
    Nesting,
    Jump,
    Argument,
    Unreferenced,
    Style,
    InfiniteLoop,
}

#[derive(Debug, Clone)]
pub struct DiagnosticEntry {
    pub level: DiagnosticLevel,
    pub category: EraDiagCategory,
    /// Severity of a warning, 0 (cosmetic) to 3 (almost an error).
    pub warn_level: u8,
    /// Empty when the file is unknown.
    pub filename: ArcStr,
    pub loc: SrcLoc,
    pub message: String,
}

impl Display for DiagnosticEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}: {}: {}", self.filename, self.loc, self.level, self.message)
    }
}

/// Entries collected while processing one file or phase. Entries pushed with
/// an empty filename are attributed to the diagnostic's own file, and take
/// whatever category was last set.
#[derive(Debug, Clone, Default)]
pub struct Diagnostic {
    filename: ArcStr,
    category: EraDiagCategory,
    entries: Vec<DiagnosticEntry>,
}

impl Diagnostic {
    pub fn new() -> Diagnostic {
        Diagnostic::default()
    }

    pub fn with_file(filename: ArcStr) -> Diagnostic {
        Diagnostic {
            filename,
            ..Default::default()
        }
    }

    pub fn with_category(mut self, category: EraDiagCategory) -> Diagnostic {
        self.category = category;
        self
    }

    pub fn set_category(&mut self, category: EraDiagCategory) -> &mut Self {
        self.category = category;
        self
    }

    pub fn entries(&self) -> &[DiagnosticEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn has_error(&self) -> bool {
        self.entries.iter().any(|x| x.level == DiagnosticLevel::Error)
    }

    fn push(
        &mut self,
        level: DiagnosticLevel,
        warn_level: u8,
        filename: ArcStr,
        loc: SrcLoc,
        message: String,
    ) -> &mut Self {
        let filename = if filename.is_empty() { self.filename.clone() } else { filename };
        self.entries.push(DiagnosticEntry {
            level,
            category: self.category,
            warn_level,
            filename,
            loc,
            message,
        });
        self
    }

    pub fn span_err(&mut self, file: ArcStr, loc: SrcLoc, msg: impl Into<String>) -> &mut Self {
        self.push(DiagnosticLevel::Error, 0, file, loc, msg.into())
    }

    /// A warning of level 1.
    pub fn span_warn(&mut self, file: ArcStr, loc: SrcLoc, msg: impl Into<String>) -> &mut Self {
        self.push(DiagnosticLevel::Warning, 1, file, loc, msg.into())
    }

    pub fn span_warn_level(
        &mut self,
        file: ArcStr,
        loc: SrcLoc,
        warn_level: u8,
        msg: impl Into<String>,
    ) -> &mut Self {
        self.push(DiagnosticLevel::Warning, warn_level, file, loc, msg.into())
    }

    pub fn span_note(&mut self, file: ArcStr, loc: SrcLoc, msg: impl Into<String>) -> &mut Self {
        self.push(DiagnosticLevel::Note, 0, file, loc, msg.into())
    }
}

/// Receiver of finished diagnostics.
pub trait EraEmitDiagnostic {
    fn emit_diag(&mut self, diag: Diagnostic);
}

/// Filtering rules applied to every diagnostic before it reaches the host.
#[derive(Debug, Clone)]
pub struct EraDiagFilter {
    pub ignored: EnumSet<EraDiagCategory>,
    pub display_once: EnumSet<EraDiagCategory>,
    pub display_warn_level: u8,
    pub fatal_warn_level: u8,
}

impl Default for EraDiagFilter {
    fn default() -> Self {
        EraDiagFilter {
            ignored: EnumSet::empty(),
            display_once: EnumSet::empty(),
            display_warn_level: 1,
            fatal_warn_level: u8::MAX,
        }
    }
}

/// Applies [`EraDiagFilter`] rules and counts what passes through.
#[derive(Debug, Default)]
pub struct EraDiagnosticSink {
    filter: EraDiagFilter,
    shown_once: FxHashSet<(ArcStr, EraDiagCategory)>,
    suppressed: usize,
    error_count: usize,
    warning_count: usize,
}

impl EraDiagnosticSink {
    pub fn new(filter: EraDiagFilter) -> Self {
        EraDiagnosticSink {
            filter,
            ..Default::default()
        }
    }

    pub fn error_count(&self) -> usize {
        self.error_count
    }

    pub fn warning_count(&self) -> usize {
        self.warning_count
    }

    pub fn suppressed_count(&self) -> usize {
        self.suppressed
    }

    /// Filters `diag` and forwards the surviving entries. Returns whether any
    /// error was forwarded.
    pub fn emit(&mut self, diag: Diagnostic, out: &mut (impl EraEmitDiagnostic + ?Sized)) -> bool {
        let Diagnostic { filename, entries, .. } = diag;
        let mut filtered = Diagnostic::with_file(filename);
        let mut has_error = false;
        for mut entry in entries {
            if self.filter.ignored.contains(entry.category) {
                self.suppressed += 1;
                continue;
            }
            if entry.level == DiagnosticLevel::Warning {
                if entry.warn_level >= self.filter.fatal_warn_level {
                    entry.level = DiagnosticLevel::Error;
                } else if entry.warn_level < self.filter.display_warn_level {
                    self.suppressed += 1;
                    continue;
                }
            }
            if self.filter.display_once.contains(entry.category)
                && matches!(entry.level, DiagnosticLevel::Warning | DiagnosticLevel::Error)
                && !self
                    .shown_once
                    .insert((entry.filename.clone(), entry.category))
            {
                self.suppressed += 1;
                continue;
            }
            match entry.level {
                DiagnosticLevel::Error => {
                    self.error_count += 1;
                    has_error = true;
                }
                DiagnosticLevel::Warning => self.warning_count += 1,
                _ => (),
            }
            filtered.entries.push(entry);
        }
        if !filtered.is_empty() {
            out.emit_diag(filtered);
        }
        has_error
    }
}

/// A single script value. `Empty` stands for an omitted argument and reads
/// as `0` or `""` depending on what is asked of it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScalarValue {
    Int(i64),
    Str(String),
    Void,
    Empty,
}

impl ScalarValue {
    pub fn kind(&self) -> ScalarValueKind {
        match self {
            ScalarValue::Int(_) => ScalarValueKind::Int,
            ScalarValue::Str(_) => ScalarValueKind::Str,
            ScalarValue::Void => ScalarValueKind::Void,
            ScalarValue::Empty => ScalarValueKind::Empty,
        }
    }

    pub fn is_str(&self) -> bool {
        matches!(self, ScalarValue::Str(_))
    }

    pub fn as_int(&self) -> Option<i64> {
        if let ScalarValue::Int(x) = self {
            Some(*x)
        } else {
            None
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        if let ScalarValue::Str(x) = self {
            Some(x)
        } else {
            None
        }
    }

    pub fn coerce_as_int(&self) -> Option<i64> {
        match self {
            ScalarValue::Empty => Some(0),
            x => x.as_int(),
        }
    }

    pub fn coerce_as_str(&self) -> Option<&str> {
        match self {
            ScalarValue::Empty => Some(""),
            x => x.as_str(),
        }
    }

    /// Truthiness used by conditions: non-zero integers and non-empty strings.
    pub fn is_truthy(&self) -> bool {
        match self {
            ScalarValue::Int(x) => *x != 0,
            ScalarValue::Str(x) => !x.is_empty(),
            ScalarValue::Void | ScalarValue::Empty => false,
        }
    }

    /// The zero value a fresh variable of `kind` holds.
    pub fn default_of(kind: ScalarValueKind) -> ScalarValue {
        match kind {
            ScalarValueKind::Int => ScalarValue::Int(0),
            ScalarValueKind::Str => ScalarValue::Str(String::new()),
            ScalarValueKind::Void => ScalarValue::Void,
            ScalarValueKind::Empty => ScalarValue::Empty,
        }
    }
}

impl Display for ScalarValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScalarValue::Int(x) => write!(f, "{x}"),
            ScalarValue::Str(x) => f.write_str(x),
            ScalarValue::Void => f.write_str("<void>"),
            ScalarValue::Empty => f.write_str("<empty>"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, Serialize, Deserialize)]
pub enum ScalarValueKind {
    Int,
    Str,
    Void,
    Empty,
}

impl ScalarValueKind {
    pub fn is_str(&self) -> bool {
        *self == ScalarValueKind::Str
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EraDefineData {
    pub filename: ArcStr,
    pub loc: SrcLoc,
    pub data: ArcStr,
}

/// Macros from `#DEFINE` lines, keyed by normalized name.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct EraDefineScope {
    defines: FxHashMap<ArcStr, EraDefineData>,
}

impl EraDefineScope {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a macro, handing back the one it replaced.
    pub fn insert(&mut self, key: ArcStr, data: EraDefineData) -> Option<EraDefineData> {
        self.defines.insert(key, data)
    }

    pub fn get(&self, key: &str) -> Option<&EraDefineData> {
        self.defines.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.defines.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.defines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.defines.is_empty()
    }
}

pub use print_flags::EraPrintExtendedFlags;

mod print_flags {
    // The `#[bitfield]` expansion wraps its generated expressions in parens.
    #![allow(unused_parens, unused_braces)]

    /// Per-print options handed to the host.
    #[modular_bitfield::bitfield]
    #[repr(u8)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EraPrintExtendedFlags {
        /// Output of a `PRINTSINGLE`-style command.
        pub is_single: bool,
        /// The host should end the line after the content.
        pub is_line: bool,
        /// The host should wait for a key after the content.
        pub is_wait: bool,
        #[skip]
        __: modular_bitfield::specifiers::B5,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, Serialize, Deserialize)]
pub enum EraExecutionBreakReason {
    StopFlag,
    CodeThrows,
    CodeQuit,
    ReachedMaxInstructions,
    InternalError,
    /// The engine needs one input value, delivered with `push_input`.
    WaitingForInput,
    HostError,
    WatchdogAbort,
}

/// Classification of runtime faults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, Serialize, Deserialize)]
pub enum EraFaultKind {
    /// Raised by the script itself, or by a line that failed validation.
    Scripted,
    /// An engine invariant was violated.
    Internal,
    /// The host or platform failed underneath the engine.
    Host,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EraCallSite {
    pub func_name: ArcStr,
    pub filename: ArcStr,
    pub loc: SrcLoc,
}

impl Display for EraCallSite {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "@{} ({}:{})", self.func_name, self.filename, self.loc)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EraRuntimeError {
    pub kind: EraFaultKind,
    pub msg: String,
    /// Where the fault happened.
    pub site: EraCallSite,
    /// Call sites from the innermost caller up to the root.
    pub call_chain: Vec<EraCallSite>,
}

impl Display for EraRuntimeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} fault at {}: {}", self.kind, self.site, self.msg)?;
        for site in &self.call_chain {
            write!(f, "\n  called from {site}")?;
        }
        Ok(())
    }
}

impl EraRuntimeError {
    pub fn break_reason(&self) -> EraExecutionBreakReason {
        match self.kind {
            EraFaultKind::Scripted => EraExecutionBreakReason::CodeThrows,
            EraFaultKind::Internal => EraExecutionBreakReason::InternalError,
            EraFaultKind::Host => EraExecutionBreakReason::HostError,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EraInputValue {
    Int(i64),
    Str(String),
}

impl EraInputValue {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            EraInputValue::Int(x) => Some(*x),
            EraInputValue::Str(x) => x.trim().parse().ok(),
        }
    }

    pub fn into_string(self) -> String {
        match self {
            EraInputValue::Int(x) => x.to_string(),
            EraInputValue::Str(x) => x,
        }
    }
}

/// Host services the loader and the executor rely on.
pub trait EraCompilerCallback {
    fn emit_diag(&mut self, diag: Diagnostic);
    fn on_get_rand(&mut self) -> u64;
    fn on_print(&mut self, content: &str, flags: EraPrintExtendedFlags);
    fn on_debugprint(&mut self, content: &str, flags: EraPrintExtendedFlags);
    fn on_wait(&mut self, any_key: bool, is_force: bool);
    /// Called once per fault, before the engine unwinds.
    fn on_runtime_error(&mut self, error: &EraRuntimeError);
    /// Returns the description stored in `slot`, or `None` if it is empty.
    fn on_get_save_info(&mut self, slot: i64) -> Option<String>;
    fn on_save_game(&mut self, slot: i64, info: &str) -> anyhow::Result<()>;
    /// Returns `Ok(false)` if `slot` holds no save.
    fn on_load_game(&mut self, slot: i64) -> anyhow::Result<bool>;
    /// Called when a run has gone `idle_ms` without yielding. Returning
    /// `true` aborts the run.
    fn on_watchdog(&mut self, idle_ms: u64) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Collect(Vec<Diagnostic>);
    impl EraEmitDiagnostic for Collect {
        fn emit_diag(&mut self, diag: Diagnostic) {
            self.0.push(diag);
        }
    }

    #[test]
    fn sink_filters_and_throttles() {
        let filter = EraDiagFilter {
            ignored: EraDiagCategory::Style.into(),
            display_once: EraDiagCategory::Unreferenced.into(),
            display_warn_level: 1,
            fatal_warn_level: 3,
        };
        let mut sink = EraDiagnosticSink::new(filter);
        let mut out = Collect(Vec::new());

        let mut diag = Diagnostic::with_file(arcstr::literal!("A.ERB"));
        diag.set_category(EraDiagCategory::Style)
            .span_warn(ArcStr::new(), SrcLoc::new(1, 0), "style");
        diag.set_category(EraDiagCategory::Unreferenced)
            .span_warn(ArcStr::new(), SrcLoc::new(2, 0), "unused 1")
            .span_warn(ArcStr::new(), SrcLoc::new(3, 0), "unused 2");
        diag.set_category(EraDiagCategory::Label)
            .span_warn_level(ArcStr::new(), SrcLoc::new(4, 0), 0, "cosmetic")
            .span_warn_level(ArcStr::new(), SrcLoc::new(5, 0), 3, "escalated");
        let has_error = sink.emit(diag, &mut out);

        assert!(has_error);
        assert_eq!(out.0.len(), 1);
        let entries = out.0[0].entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].message, "unused 1");
        assert_eq!(entries[1].level, DiagnosticLevel::Error);
        assert_eq!(entries[1].filename.as_str(), "A.ERB");
        assert_eq!(sink.suppressed_count(), 3);
        assert_eq!(sink.error_count(), 1);
    }

    #[test]
    fn entries_take_the_file_and_category() {
        let mut diag = Diagnostic::with_file(arcstr::literal!("MAIN.ERB"));
        diag.set_category(EraDiagCategory::Jump)
            .span_err(ArcStr::new(), SrcLoc::new(3, 4), "no such label")
            .span_note(arcstr::literal!("OTHER.ERB"), SrcLoc::default(), "declared here");
        let entries = diag.entries();
        assert!(diag.has_error());
        assert_eq!(entries[0].to_string(), "MAIN.ERB:3:5: error: no such label");
        assert_eq!(entries[1].to_string(), "OTHER.ERB:1:1: note: declared here");
        assert!(entries.iter().all(|x| x.category == EraDiagCategory::Jump));

        let wide = SrcSpan::new_covering(
            SrcSpan::new(SrcPos(8), 2),
            SrcSpan::new(SrcPos(3), 1),
        );
        assert_eq!((wide.start(), wide.end()), (SrcPos(3), SrcPos(10)));
        assert_eq!(SrcLoc::new(2, 1).with_span(wide).col, 4);
    }
}
