use arcstr::ArcStr;
use smallvec::SmallVec;

use crate::{
    commands::{EraCmd, EraCmdArg},
    expr::EraVarRef,
    types::*,
    vars::EraVarDecl,
};

/// Index of a line in the program's line arena. The line that follows a line
/// in execution order is always `id + 1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EraLineId(pub u32);

impl EraLineId {
    pub fn next(self) -> EraLineId {
        EraLineId(self.0 + 1)
    }

    pub fn idx(self) -> usize {
        self.0 as usize
    }
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct EraFuncFlags: u32 {
        const IS_EVENT = 1 << 0;
        const IS_SYSTEM = 1 << 1;
        const IS_METHOD = 1 << 2;
        const IS_SINGLE = 1 << 3;
        const IS_PRI = 1 << 4;
        const IS_LATER = 1 << 5;
        const IS_ONLY = 1 << 6;
    }
}

/// Dependency depth of a function that no validated function reaches.
pub const DEPTH_UNREACHED: i32 = -1;

#[derive(Debug, Clone)]
pub struct EraFunctionLabel {
    pub name: ArcStr,
    pub flags: EraFuncFlags,
    /// Return type of a `#FUNCTION` (`Int`) or `#FUNCTIONS` (`Str`).
    pub method_kind: Option<ScalarValueKind>,
    pub params: Vec<EraVarRef>,
    /// Same length as `params`.
    pub defaults: Vec<Option<ScalarValue>>,
    pub local_size: Option<u32>,
    pub locals_size: Option<u32>,
    pub private_decls: Vec<EraVarDecl>,
    pub depth: i32,
    /// The `Null` line ending this function.
    pub end: EraLineId,
    pub checked: bool,
    pub error: Option<String>,
}

impl EraFunctionLabel {
    pub fn new(name: ArcStr) -> Self {
        EraFunctionLabel {
            name,
            flags: EraFuncFlags::empty(),
            method_kind: None,
            params: Vec::new(),
            defaults: Vec::new(),
            local_size: None,
            locals_size: None,
            private_decls: Vec::new(),
            depth: DEPTH_UNREACHED,
            end: EraLineId(0),
            checked: false,
            error: None,
        }
    }

    pub fn is_event(&self) -> bool {
        self.flags.contains(EraFuncFlags::IS_EVENT)
    }

    pub fn is_method(&self) -> bool {
        self.flags.contains(EraFuncFlags::IS_METHOD)
    }
}

#[derive(Debug, Clone)]
pub struct EraInstruction {
    pub cmd: EraCmd,
    pub raw_arg: ArcStr,
    /// Column of `raw_arg` inside the line.
    pub raw_base: u32,
    pub arg: Option<EraCmdArg>,
    /// Forward or backward link set by validation.
    pub jump_to: Option<EraLineId>,
    /// Intermediate branch lines (`ELSEIF`, `CASE`, `FUNC`, ...).
    pub branches: SmallVec<[EraLineId; 2]>,
    /// Resolved call or goto target.
    pub target: Option<EraLineId>,
    pub error: Option<String>,
}

impl EraInstruction {
    pub fn new(cmd: EraCmd, raw_arg: ArcStr, raw_base: u32) -> Self {
        EraInstruction {
            cmd,
            raw_arg,
            raw_base,
            arg: None,
            jump_to: None,
            branches: SmallVec::new(),
            target: None,
            error: None,
        }
    }
}

#[derive(Debug, Clone)]
pub enum EraLineKind {
    /// Ends a function.
    Null,
    FunctionLabel(Box<EraFunctionLabel>),
    GotoLabel(ArcStr),
    Instruction(Box<EraInstruction>),
    Invalid(String),
}

#[derive(Debug, Clone)]
pub struct EraLine {
    pub filename: ArcStr,
    pub loc: SrcLoc,
    /// The function label owning this line.
    pub func: EraLineId,
    pub kind: EraLineKind,
}

impl EraLine {
    pub fn as_func(&self) -> Option<&EraFunctionLabel> {
        match &self.kind {
            EraLineKind::FunctionLabel(x) => Some(x),
            _ => None,
        }
    }

    pub fn as_func_mut(&mut self) -> Option<&mut EraFunctionLabel> {
        match &mut self.kind {
            EraLineKind::FunctionLabel(x) => Some(x),
            _ => None,
        }
    }

    pub fn as_inst(&self) -> Option<&EraInstruction> {
        match &self.kind {
            EraLineKind::Instruction(x) => Some(x),
            _ => None,
        }
    }

    pub fn as_inst_mut(&mut self) -> Option<&mut EraInstruction> {
        match &mut self.kind {
            EraLineKind::Instruction(x) => Some(x),
            _ => None,
        }
    }

    pub fn cmd(&self) -> Option<EraCmd> {
        self.as_inst().map(|x| x.cmd)
    }

    /// Error attached to this line, if executing it must fault.
    pub fn error(&self) -> Option<&str> {
        match &self.kind {
            EraLineKind::Instruction(x) => x.error.as_deref(),
            EraLineKind::FunctionLabel(x) => x.error.as_deref(),
            EraLineKind::Invalid(msg) => Some(msg),
            EraLineKind::Null | EraLineKind::GotoLabel(_) => None,
        }
    }
}

/// The loaded program: every function of every file, laid out contiguously.
#[derive(Debug, Default)]
pub struct EraProgram {
    lines: Vec<EraLine>,
}

impl EraProgram {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, line: EraLine) -> EraLineId {
        let id = EraLineId(self.lines.len() as u32);
        self.lines.push(line);
        id
    }

    pub fn next_id(&self) -> EraLineId {
        EraLineId(self.lines.len() as u32)
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn get(&self, id: EraLineId) -> Option<&EraLine> {
        self.lines.get(id.idx())
    }

    pub fn get_mut(&mut self, id: EraLineId) -> Option<&mut EraLine> {
        self.lines.get_mut(id.idx())
    }

    pub fn func(&self, id: EraLineId) -> Option<&EraFunctionLabel> {
        self.get(id)?.as_func()
    }

    pub fn func_mut(&mut self, id: EraLineId) -> Option<&mut EraFunctionLabel> {
        self.get_mut(id)?.as_func_mut()
    }

    pub fn inst(&self, id: EraLineId) -> Option<&EraInstruction> {
        self.get(id)?.as_inst()
    }

    pub fn inst_mut(&mut self, id: EraLineId) -> Option<&mut EraInstruction> {
        self.get_mut(id)?.as_inst_mut()
    }

    /// Ids of the body lines of the function labelled at `func`, excluding
    /// the label and the terminating `Null` line.
    pub fn body_of(&self, func: EraLineId) -> impl Iterator<Item = EraLineId> {
        let end = self.func(func).map_or(func.0 + 1, |x| x.end.0);
        (func.0 + 1..end).map(EraLineId)
    }

    pub fn function_ids(&self) -> impl Iterator<Item = EraLineId> + '_ {
        self.lines
            .iter()
            .enumerate()
            .filter(|(_, x)| matches!(x.kind, EraLineKind::FunctionLabel(_)))
            .map(|(i, _)| EraLineId(i as u32))
    }

    /// Marks the line with an error unless it already carries one. Goto
    /// labels become invalid lines.
    pub fn set_error(&mut self, id: EraLineId, msg: impl Into<String>) {
        let Some(line) = self.get_mut(id) else {
            return;
        };
        match &mut line.kind {
            EraLineKind::Instruction(x) => {
                x.error.get_or_insert_with(|| msg.into());
            }
            EraLineKind::FunctionLabel(x) => {
                x.error.get_or_insert_with(|| msg.into());
            }
            EraLineKind::Invalid(_) | EraLineKind::Null => (),
            EraLineKind::GotoLabel(_) => {
                line.kind = EraLineKind::Invalid(msg.into());
            }
        }
    }
}
