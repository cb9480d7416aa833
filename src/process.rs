use std::time::Instant;

use arcstr::ArcStr;
use log::debug;

use crate::{
    commands::EraBeginKind,
    flow::EraPhase,
    line::EraLineId,
    types::*,
    vars::EraVarCell,
};

/// Hard cap on active frames.
pub const MAX_CALL_DEPTH: usize = 1024;
/// Hard cap on nested value-returning calls made from expressions.
pub const MAX_EVAL_CALL_DEPTH: usize = 100;

/// Position of an event dispatch among the contributions of one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EraEventCursor {
    pub name: ArcStr,
    pub group: usize,
    pub index: usize,
    /// An `#ONLY` contribution ends the dispatch on its first return.
    pub is_only: bool,
}

#[derive(Debug, Clone)]
pub struct EraCallFrame {
    /// The label whose body is executing. Changes as an event dispatch
    /// advances through its contributions.
    pub label: EraLineId,
    pub event: Option<EraEventCursor>,
    /// Popped on its first return, together with the frame that jumped.
    pub is_jump: bool,
    /// Evaluated from an expression; its result goes to the caller directly.
    pub is_method: bool,
    pub return_to: Option<EraLineId>,
    /// The calling line, if the call came from a script.
    pub call_site: Option<EraLineId>,
    /// `DYNAMIC` privates and `REF` parameter aliases.
    pub privates: FxHashMap<ArcStr, EraVarCell>,
}

impl EraCallFrame {
    pub fn new(label: EraLineId) -> Self {
        EraCallFrame {
            label,
            event: None,
            is_jump: false,
            is_method: false,
            return_to: None,
            call_site: None,
            privates: FxHashMap::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub enum EraBoundArg {
    Value(ScalarValue),
    Ref(EraVarCell),
}

/// A frame waiting to be entered, possibly after its function is validated.
#[derive(Debug, Clone)]
pub struct EraPendingEntry {
    pub frame: EraCallFrame,
    pub args: Vec<EraBoundArg>,
}

/// Scratch data of the game-flow phases.
#[derive(Debug, Clone, Default)]
pub struct EraFlowState {
    /// Numbers of the `COM{n}` functions, ascending.
    pub coms: Vec<i64>,
    pub com_index: usize,
    pub available: Vec<i64>,
    pub selected: i64,
    pub slot: i64,
}

#[derive(Debug, Clone)]
struct EraProcessSnapshot {
    frames: Vec<EraCallFrame>,
    cursor: Option<EraLineId>,
    phase: EraPhase,
}

/// Saved stack floor of a nested run.
#[derive(Debug, Clone, Copy)]
#[must_use]
pub struct EraFloorGuard {
    floor: usize,
    cursor: Option<EraLineId>,
}

/// Everything that changes while scripts execute, apart from variables.
#[derive(Debug)]
pub struct EraProcessState {
    pub(crate) frames: Vec<EraCallFrame>,
    /// The next line to execute in the top frame.
    pub(crate) cursor: Option<EraLineId>,
    /// Frames below the floor belong to an outer run and are never popped.
    pub(crate) floor: usize,
    phase: EraPhase,
    pub(crate) pending_begin: Option<EraBeginKind>,
    pub(crate) pending_entry: Option<EraPendingEntry>,
    /// Result of the last value-returning call.
    pub(crate) method_result: Option<ScalarValue>,
    pub(crate) flow: EraFlowState,
    pub(crate) last_error: Option<EraRuntimeError>,
    input: Option<EraInputValue>,
    snapshots: Vec<EraProcessSnapshot>,
    phase_since: Instant,
}

impl Default for EraProcessState {
    fn default() -> Self {
        Self::new()
    }
}

impl EraProcessState {
    pub fn new() -> Self {
        EraProcessState {
            frames: Vec::new(),
            cursor: None,
            floor: 0,
            phase: EraPhase::TitleBegin,
            pending_begin: None,
            pending_entry: None,
            method_result: None,
            flow: EraFlowState::default(),
            last_error: None,
            input: None,
            snapshots: Vec::new(),
            phase_since: Instant::now(),
        }
    }

    pub fn frames(&self) -> &[EraCallFrame] {
        &self.frames
    }

    pub fn cursor(&self) -> Option<EraLineId> {
        self.cursor
    }

    pub fn phase(&self) -> EraPhase {
        self.phase
    }

    pub fn set_phase(&mut self, phase: EraPhase) {
        if phase != self.phase {
            debug!("phase {} -> {}", self.phase, phase);
            self.phase_since = Instant::now();
        }
        self.phase = phase;
    }

    /// Milliseconds since the last phase change.
    pub fn idle_ms(&self) -> u64 {
        self.phase_since.elapsed().as_millis() as u64
    }

    pub fn reset_idle(&mut self) {
        self.phase_since = Instant::now();
    }

    /// No frame of the current run is active.
    pub fn is_script_end(&self) -> bool {
        self.frames.len() <= self.floor && self.pending_entry.is_none()
    }

    /// Starts a nested run on top of the active frames.
    pub fn enter_floor(&mut self) -> EraFloorGuard {
        let guard = EraFloorGuard {
            floor: self.floor,
            cursor: self.cursor,
        };
        self.floor = self.frames.len();
        guard
    }

    pub fn leave_floor(&mut self, guard: EraFloorGuard) {
        self.floor = guard.floor;
        self.cursor = guard.cursor;
    }

    /// Stores the single pending input value. Fails if one is already
    /// waiting.
    pub fn push_input(&mut self, value: EraInputValue) -> Result<(), String> {
        if self.input.is_some() {
            return Err("an input value is already pending".to_owned());
        }
        self.input = Some(value);
        Ok(())
    }

    pub fn take_input(&mut self) -> Option<EraInputValue> {
        self.input.take()
    }

    pub fn has_input(&self) -> bool {
        self.input.is_some()
    }

    /// Saves the frames, cursor and phase, leaving an empty stack behind.
    pub fn push_snapshot(&mut self) {
        self.snapshots.push(EraProcessSnapshot {
            frames: std::mem::take(&mut self.frames),
            cursor: self.cursor.take(),
            phase: self.phase,
        });
        self.floor = 0;
    }

    /// Restores the last snapshot. Returns `false` if there is none.
    pub fn pop_snapshot(&mut self) -> bool {
        let Some(snapshot) = self.snapshots.pop() else {
            return false;
        };
        self.frames = snapshot.frames;
        self.cursor = snapshot.cursor;
        self.floor = 0;
        self.set_phase(snapshot.phase);
        true
    }

    pub fn clear_snapshots(&mut self) {
        self.snapshots.clear();
    }

    pub fn snapshot_depth(&self) -> usize {
        self.snapshots.len()
    }

    /// Drops the frames above `floor` after a nested run failed. The outer
    /// run and its phase are left as they were.
    pub fn unwind_to(&mut self, floor: usize) {
        self.frames.truncate(floor);
        self.pending_entry = None;
        self.pending_begin = None;
        self.method_result = None;
    }

    /// Drops every frame and stops the flow.
    pub fn halt(&mut self) {
        self.frames.clear();
        self.cursor = None;
        self.floor = 0;
        self.pending_begin = None;
        self.pending_entry = None;
        self.method_result = None;
        self.set_phase(EraPhase::Quit);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshots_restore_frames_cursor_and_phase() {
        let mut state = EraProcessState::new();
        state.frames.push(EraCallFrame::new(EraLineId(3)));
        state.cursor = Some(EraLineId(5));
        state.set_phase(EraPhase::ShopBegin);

        state.push_snapshot();
        assert!(state.frames().is_empty());
        assert_eq!(state.cursor(), None);
        assert_eq!(state.snapshot_depth(), 1);
        state.set_phase(EraPhase::SaveGameShowMenu);

        assert!(state.pop_snapshot());
        assert_eq!(state.frames().len(), 1);
        assert_eq!(state.cursor(), Some(EraLineId(5)));
        assert_eq!(state.phase(), EraPhase::ShopBegin);
        assert!(!state.pop_snapshot());
    }

    #[test]
    fn only_one_input_is_pending() {
        let mut state = EraProcessState::new();
        assert!(state.push_input(EraInputValue::Int(1)).is_ok());
        assert!(state.push_input(EraInputValue::Int(2)).is_err());
        assert_eq!(state.take_input(), Some(EraInputValue::Int(1)));
        assert!(!state.has_input());
        assert!(state.push_input(EraInputValue::Str("x".to_owned())).is_ok());
    }

    #[test]
    fn floors_hide_outer_frames() {
        let mut state = EraProcessState::new();
        state.frames.push(EraCallFrame::new(EraLineId(0)));
        state.cursor = Some(EraLineId(1));
        assert!(!state.is_script_end());

        let guard = state.enter_floor();
        assert!(state.is_script_end());
        state.frames.push(EraCallFrame::new(EraLineId(7)));
        state.cursor = Some(EraLineId(8));
        assert!(!state.is_script_end());
        state.frames.pop();
        state.leave_floor(guard);
        assert_eq!(state.cursor(), Some(EraLineId(1)));
        assert_eq!(state.floor, 0);
    }

    #[test]
    fn halt_clears_everything() {
        let mut state = EraProcessState::new();
        state.frames.push(EraCallFrame::new(EraLineId(0)));
        state.pending_begin = Some(EraBeginKind::Shop);
        state.halt();
        assert!(state.frames().is_empty());
        assert_eq!(state.pending_begin, None);
        assert_eq!(state.phase(), EraPhase::Quit);
    }
}
