use arcstr::ArcStr;

use crate::expr::{EraBinaryOp, EraExpr, EraFormString, EraVarRef};

/// Script commands. `Set` is synthesized from assignment lines and is never
/// looked up by name.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumString, strum::IntoStaticStr,
)]
#[strum(serialize_all = "UPPERCASE", ascii_case_insensitive)]
pub enum EraCmd {
    // ----- Output -----
    Print,
    PrintL,
    PrintW,
    PrintForm,
    PrintFormL,
    PrintFormW,
    PrintS,
    PrintSL,
    PrintSW,
    PrintV,
    PrintVL,
    PrintVW,
    PrintFormS,
    PrintFormSL,
    PrintFormSW,
    PrintSingle,
    PrintSingleForm,
    PrintSingleS,
    PrintSingleV,
    PrintSingleFormS,
    DebugPrint,
    DebugPrintL,
    DrawLine,
    // ----- Assignment -----
    Set,
    VarSet,
    Swap,
    // ----- Control flow -----
    Sif,
    If,
    ElseIf,
    Else,
    EndIf,
    SelectCase,
    Case,
    CaseElse,
    EndSelect,
    Repeat,
    Rend,
    For,
    Next,
    While,
    Wend,
    Do,
    Loop,
    Break,
    Continue,
    // ----- Calls and jumps -----
    Call,
    CallF,
    CallForm,
    CallFormF,
    TryCall,
    TryCallForm,
    Jump,
    JumpForm,
    TryJump,
    TryJumpForm,
    Goto,
    GotoForm,
    TryGoto,
    TryGotoForm,
    TryCallList,
    TryJumpList,
    TryGotoList,
    Func,
    EndFunc,
    TryCCall,
    TryCCallForm,
    TryCJump,
    TryCJumpForm,
    TryCGoto,
    TryCGotoForm,
    Catch,
    EndCatch,
    Return,
    ReturnF,
    ReturnForm,
    Restart,
    Begin,
    // ----- Data blocks -----
    PrintData,
    PrintDataL,
    PrintDataW,
    StrData,
    Data,
    DataForm,
    DataList,
    EndList,
    EndData,
    // ----- Misc -----
    NoSkip,
    EndNoSkip,
    Throw,
    Quit,
    Wait,
    Input,
    InputS,
    SaveGame,
    LoadGame,
}

/// How the raw argument text of a command is read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EraArgFormat {
    None,
    /// Literal text, with one leading blank removed.
    RawText,
    /// Unquoted form string.
    Form,
    Expr,
    OptExpr,
    ExprList,
    /// The whole line as `lhs op rhs`.
    Assign,
    VarSet,
    Swap,
    For,
    Case,
    /// `NAME[, args]` or `NAME(args)`.
    CallName,
    /// `form[, args]` or `form(args)`.
    CallForm,
    GotoName,
    GotoForm,
    Begin,
    OptVar,
}

/// How a print-like command ends its output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EraPrintEnd {
    None,
    Line,
    Wait,
}

/// What a call-like command does with its target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EraCallKind {
    Call,
    Jump,
    Goto,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EraCallCmdInfo {
    pub kind: EraCallKind,
    pub is_form: bool,
    /// `TRY*`: a missing target is not an error.
    pub is_try: bool,
    /// `TRYC*`: a missing target runs the `CATCH` block.
    pub has_catch: bool,
    /// `CALLF`/`CALLFORMF`: a method call whose result is discarded.
    pub is_method_call: bool,
}

impl EraCmd {
    pub fn from_name(name: &str) -> Option<EraCmd> {
        match name.parse() {
            Ok(EraCmd::Set) | Err(_) => None,
            Ok(cmd) => Some(cmd),
        }
    }

    pub fn name(self) -> &'static str {
        self.into()
    }

    pub fn arg_format(self) -> EraArgFormat {
        use EraArgFormat as F;
        use EraCmd::*;
        match self {
            Print | PrintL | PrintW | PrintSingle | DebugPrint | DebugPrintL | Data => F::RawText,
            PrintForm | PrintFormL | PrintFormW | PrintSingleForm | DataForm | Throw => F::Form,
            ReturnForm => F::Form,
            PrintS | PrintSL | PrintSW | PrintSingleS | PrintFormS | PrintFormSL | PrintFormSW
            | PrintSingleFormS => F::Expr,
            PrintV | PrintVL | PrintVW | PrintSingleV => F::ExprList,
            Set => F::Assign,
            VarSet => F::VarSet,
            Swap => F::Swap,
            Sif | If | ElseIf | While | Loop | SelectCase | Repeat => F::Expr,
            Case => F::Case,
            For => F::For,
            Return => F::ExprList,
            ReturnF => F::OptExpr,
            Call | CallF | TryCall | Jump | TryJump | TryCCall | TryCJump => F::CallName,
            CallForm | CallFormF | TryCallForm | JumpForm | TryJumpForm | TryCCallForm
            | TryCJumpForm | Func => F::CallForm,
            Goto | TryGoto | TryCGoto => F::GotoName,
            GotoForm | TryGotoForm | TryCGotoForm => F::GotoForm,
            Begin => F::Begin,
            StrData => F::OptVar,
            DrawLine | Else | EndIf | CaseElse | EndSelect | Rend | Next | Wend | Do | Break
            | Continue | TryCallList | TryJumpList | TryGotoList | EndFunc | Catch | EndCatch
            | Restart | PrintData | PrintDataL | PrintDataW | DataList | EndList | EndData
            | NoSkip | EndNoSkip | Quit | Wait | Input | InputS | SaveGame | LoadGame => F::None,
        }
    }

    /// Commands allowed inside `#FUNCTION`/`#FUNCTIONS` bodies.
    pub fn is_method_safe(self) -> bool {
        use EraCmd::*;
        match self {
            Set | VarSet | Swap | Sif | If | ElseIf | Else | EndIf | SelectCase | Case
            | CaseElse | EndSelect | Repeat | Rend | For | Next | While | Wend | Do | Loop
            | Break | Continue | ReturnF | CallF | CallFormF | Throw | StrData | Data
            | DataForm | DataList | EndList | EndData | Goto | GotoForm | TryGoto
            | TryGotoForm | TryCGoto | TryCGotoForm | Catch | EndCatch | TryGotoList | Func
            | EndFunc | NoSkip | EndNoSkip | DebugPrint | DebugPrintL | Restart => true,
            _ => false,
        }
    }

    pub fn print_end(self) -> EraPrintEnd {
        use EraCmd::*;
        match self {
            PrintL | PrintFormL | PrintSL | PrintVL | PrintFormSL | DebugPrintL | PrintDataL => {
                EraPrintEnd::Line
            }
            PrintW | PrintFormW | PrintSW | PrintVW | PrintFormSW | PrintDataW => EraPrintEnd::Wait,
            _ => EraPrintEnd::None,
        }
    }

    pub fn is_print_single(self) -> bool {
        use EraCmd::*;
        matches!(
            self,
            PrintSingle | PrintSingleForm | PrintSingleS | PrintSingleV | PrintSingleFormS
        )
    }

    pub fn is_print_data(self) -> bool {
        matches!(self, EraCmd::PrintData | EraCmd::PrintDataL | EraCmd::PrintDataW)
    }

    pub fn call_info(self) -> Option<EraCallCmdInfo> {
        use EraCallKind as K;
        use EraCmd::*;
        let (kind, is_form, is_try, has_catch, is_method_call) = match self {
            Call => (K::Call, false, false, false, false),
            CallF => (K::Call, false, false, false, true),
            CallForm => (K::Call, true, false, false, false),
            CallFormF => (K::Call, true, false, false, true),
            TryCall => (K::Call, false, true, false, false),
            TryCallForm => (K::Call, true, true, false, false),
            Jump => (K::Jump, false, false, false, false),
            JumpForm => (K::Jump, true, false, false, false),
            TryJump => (K::Jump, false, true, false, false),
            TryJumpForm => (K::Jump, true, true, false, false),
            Goto => (K::Goto, false, false, false, false),
            GotoForm => (K::Goto, true, false, false, false),
            TryGoto => (K::Goto, false, true, false, false),
            TryGotoForm => (K::Goto, true, true, false, false),
            TryCCall => (K::Call, false, true, true, false),
            TryCCallForm => (K::Call, true, true, true, false),
            TryCJump => (K::Jump, false, true, true, false),
            TryCJumpForm => (K::Jump, true, true, true, false),
            TryCGoto => (K::Goto, false, true, true, false),
            TryCGotoForm => (K::Goto, true, true, true, false),
            _ => return None,
        };
        Some(EraCallCmdInfo {
            kind,
            is_form,
            is_try,
            has_catch,
            is_method_call,
        })
    }

    /// The call kind of a `TRY*LIST` opener.
    pub fn list_call_kind(self) -> Option<EraCallKind> {
        match self {
            EraCmd::TryCallList => Some(EraCallKind::Call),
            EraCmd::TryJumpList => Some(EraCallKind::Jump),
            EraCmd::TryGotoList => Some(EraCallKind::Goto),
            _ => None,
        }
    }

    pub fn is_loop_opener(self) -> bool {
        use EraCmd::*;
        matches!(self, Repeat | For | While | Do)
    }

    /// The closer matching a loop opener.
    pub fn loop_closer(self) -> Option<EraCmd> {
        use EraCmd::*;
        Some(match self {
            Repeat => Rend,
            For => Next,
            While => Wend,
            Do => Loop,
            _ => return None,
        })
    }
}

/// Destination of a `BEGIN`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::EnumString)]
#[strum(serialize_all = "UPPERCASE", ascii_case_insensitive)]
pub enum EraBeginKind {
    Title,
    First,
    Train,
    AfterTrain,
    Ablup,
    TurnEnd,
    Shop,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EraCallTarget {
    Name(ArcStr),
    Form(EraFormString),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EraCaseItem {
    Value(EraExpr),
    /// `lo TO hi`
    Range(EraExpr, EraExpr),
    /// `IS op value`
    Cond(EraBinaryOp, EraExpr),
}

/// Materialized command arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EraCmdArg {
    Empty,
    Text(ArcStr),
    Form(EraFormString),
    Expr(EraExpr),
    ExprList(Vec<EraExpr>),
    Assign {
        lhs: EraVarRef,
        /// `None` for plain assignment.
        op: Option<EraBinaryOp>,
        rhs: EraExpr,
    },
    VarSet {
        var: EraVarRef,
        value: Option<EraExpr>,
    },
    Swap(EraVarRef, EraVarRef),
    For {
        var: EraVarRef,
        start: EraExpr,
        end: EraExpr,
        step: Option<EraExpr>,
    },
    Case(Vec<EraCaseItem>),
    Call {
        target: EraCallTarget,
        args: Vec<Option<EraExpr>>,
    },
    Goto(EraCallTarget),
    Begin(EraBeginKind),
    Var(Option<EraVarRef>),
}

impl EraCmdArg {
    pub fn as_expr(&self) -> Option<&EraExpr> {
        match self {
            EraCmdArg::Expr(x) => Some(x),
            _ => None,
        }
    }

    /// Visits every expression in the argument, sub-expressions included.
    pub fn walk_exprs(&self, f: &mut impl FnMut(&EraExpr)) {
        fn var(var: &EraVarRef, f: &mut impl FnMut(&EraExpr)) {
            var.indices.iter().for_each(|x| x.walk(f));
        }
        match self {
            EraCmdArg::Empty | EraCmdArg::Text(_) | EraCmdArg::Begin(_) => (),
            EraCmdArg::Form(form) => form.walk(f),
            EraCmdArg::Expr(x) => x.walk(f),
            EraCmdArg::ExprList(list) => list.iter().for_each(|x| x.walk(f)),
            EraCmdArg::Assign { lhs, rhs, .. } => {
                var(lhs, f);
                rhs.walk(f);
            }
            EraCmdArg::VarSet { var: target, value } => {
                var(target, f);
                if let Some(value) = value {
                    value.walk(f);
                }
            }
            EraCmdArg::Swap(a, b) => {
                var(a, f);
                var(b, f);
            }
            EraCmdArg::For {
                var: counter,
                start,
                end,
                step,
            } => {
                var(counter, f);
                start.walk(f);
                end.walk(f);
                if let Some(step) = step {
                    step.walk(f);
                }
            }
            EraCmdArg::Case(items) => {
                for item in items {
                    match item {
                        EraCaseItem::Value(x) | EraCaseItem::Cond(_, x) => x.walk(f),
                        EraCaseItem::Range(lo, hi) => {
                            lo.walk(f);
                            hi.walk(f);
                        }
                    }
                }
            }
            EraCmdArg::Call { target, args } => {
                if let EraCallTarget::Form(form) = target {
                    form.walk(f);
                }
                args.iter().flatten().for_each(|x| x.walk(f));
            }
            EraCmdArg::Goto(target) => {
                if let EraCallTarget::Form(form) = target {
                    form.walk(f);
                }
            }
            EraCmdArg::Var(target) => {
                if let Some(target) = target {
                    var(target, f);
                }
            }
        }
    }

    /// Variables written by the command itself.
    pub fn target_vars(&self) -> impl Iterator<Item = &EraVarRef> {
        let (a, b) = match self {
            EraCmdArg::Assign { lhs, .. } => (Some(lhs), None),
            EraCmdArg::VarSet { var, .. } => (Some(var), None),
            EraCmdArg::Swap(x, y) => (Some(x), Some(y)),
            EraCmdArg::For { var, .. } => (Some(var), None),
            EraCmdArg::Var(var) => (var.as_ref(), None),
            _ => (None, None),
        };
        a.into_iter().chain(b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_caseless() {
        assert_eq!(EraCmd::from_name("printform"), Some(EraCmd::PrintForm));
        assert_eq!(EraCmd::from_name("TRYCCALLFORM"), Some(EraCmd::TryCCallForm));
        assert_eq!(EraCmd::from_name("PrintDataL"), Some(EraCmd::PrintDataL));
        assert_eq!(EraCmd::from_name("SET"), None);
        assert_eq!(EraCmd::from_name("FLAG"), None);
        assert_eq!(EraCmd::ElseIf.name(), "ELSEIF");
    }

    #[test]
    fn command_properties() {
        assert!(EraCmd::CallF.is_method_safe());
        assert!(!EraCmd::Call.is_method_safe());
        assert!(!EraCmd::PrintForm.is_method_safe());
        assert_eq!(EraCmd::PrintFormL.print_end(), EraPrintEnd::Line);
        let info = EraCmd::TryCJumpForm.call_info().expect("call-like");
        assert_eq!(info.kind, EraCallKind::Jump);
        assert!(info.is_form && info.is_try && info.has_catch);
        assert_eq!(EraCmd::Do.loop_closer(), Some(EraCmd::Loop));
        assert_eq!("aftertrain".parse::<EraBeginKind>().ok(), Some(EraBeginKind::AfterTrain));
    }
}
