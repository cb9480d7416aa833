use arcstr::ArcStr;
use once_cell::sync::Lazy;

use crate::{
    commands::{EraArgFormat, EraCallTarget, EraCaseItem, EraCmd, EraCmdArg},
    expr::{EraBinaryOp, EraExpr, EraExprCtx, EraExprParser, EraParseError, EraVarRef, ParseResult},
    header::{parse_dim_decl, resolve_dim, EraDimDecl},
    interpret::{EraInterpretError, EraInterpreter},
    lexer::{normalize_ident, EraLexer, EraToken, EraTokenKind},
    line::{EraFuncFlags, EraFunctionLabel, EraInstruction, EraLineKind},
    types::*,
    util::{bmatch_caseless, check_ident, is_ident_char, Ascii},
};

/// Event functions: every file may contribute one definition.
pub const EVENT_FUNCTIONS: &[&str] = &[
    "EVENTFIRST",
    "EVENTTRAIN",
    "EVENTSHOP",
    "EVENTBUY",
    "EVENTCOM",
    "EVENTTURNEND",
    "EVENTCOMEND",
    "EVENTEND",
    "EVENTLOAD",
];

const SYSTEM_FUNCTIONS: &[&str] = &[
    "SYSTEM_TITLE",
    "SHOW_STATUS",
    "SHOW_USERCOM",
    "USERCOM",
    "SOURCE_CHECK",
    "SHOW_JUEL",
    "SHOW_ABLUP_SELECT",
    "USERABLUP",
    "SHOW_SHOP",
    "USERSHOP",
    "SAVEINFO",
    "SYSTEM_LOAD",
];

/// Families of system functions numbered by a suffix, e.g. `COM12`.
const NUMBERED_SYSTEM_FUNCTIONS: &[&str] = &["COM_ABLE", "COM", "ABLUP"];

static EVENT_FUNCTION_SET: Lazy<FxHashSet<&'static Ascii<str>>> =
    Lazy::new(|| EVENT_FUNCTIONS.iter().map(|&x| Ascii::new_str(x)).collect());
static SYSTEM_FUNCTION_SET: Lazy<FxHashSet<&'static Ascii<str>>> =
    Lazy::new(|| SYSTEM_FUNCTIONS.iter().map(|&x| Ascii::new_str(x)).collect());

pub fn is_event_function(name: &str) -> bool {
    EVENT_FUNCTION_SET.contains(Ascii::new_str(name))
}

pub fn is_system_function(name: &str) -> bool {
    if SYSTEM_FUNCTION_SET.contains(Ascii::new_str(name)) {
        return true;
    }
    let name = Ascii::new_str(name);
    NUMBERED_SYSTEM_FUNCTIONS.iter().any(|prefix| {
        name.starts_with(prefix) && {
            let rest = &name.as_ref()[prefix.len()..];
            !rest.is_empty() && rest.bytes().all(|b| b.is_ascii_digit())
        }
    })
}

fn ident_prefix_len(text: &str) -> usize {
    text.find(|c: char| !is_ident_char(c)).unwrap_or(text.len())
}

fn leading_blank_len(text: &str) -> usize {
    text.len() - text.trim_start().len()
}

/// Removes at most one leading blank, the separator after a command name.
fn strip_one_blank(text: &str) -> (&str, u32) {
    match text.chars().next() {
        Some(c @ (' ' | '\t' | '\u{3000}')) => (&text[c.len_utf8()..], c.len_utf8() as u32),
        _ => (text, 0),
    }
}

/// Parses a `@name` or `$name` line. Never fails; malformed labels become
/// invalid lines.
pub fn parse_label_line(
    text: &str,
    col: u32,
    ctx: EraExprCtx,
    lookup: &dyn Fn(&str, &[i64]) -> Option<ScalarValue>,
) -> EraLineKind {
    let (is_func, body) = match text.as_bytes().first() {
        Some(b'@') => (true, &text[1..]),
        Some(b'$') => (false, &text[1..]),
        _ => return EraLineKind::Invalid("expected a label".to_owned()),
    };
    let name_len = ident_prefix_len(body);
    let (name, rest) = body.split_at(name_len);
    if let Err(e) = check_ident(name) {
        return EraLineKind::Invalid(format!("invalid label: {e}"));
    }
    let name = normalize_ident(name, ctx.ignore_case);
    if !is_func {
        if !rest.trim().is_empty() {
            return EraLineKind::Invalid(format!("unexpected `{}` after goto label", rest.trim()));
        }
        return EraLineKind::GotoLabel(name);
    }
    if EraCmd::from_name(&name).is_some() {
        return EraLineKind::Invalid(format!("`{name}` is a command name"));
    }

    let mut label = EraFunctionLabel::new(name);
    if is_event_function(&label.name) {
        label.flags |= EraFuncFlags::IS_EVENT | EraFuncFlags::IS_SYSTEM;
    } else if is_system_function(&label.name) {
        label.flags |= EraFuncFlags::IS_SYSTEM;
    }

    let rest_base = col + 1 + name_len as u32;
    let params_src = rest.trim_start();
    let params_base = rest_base + leading_blank_len(rest) as u32;
    let params = if let Some(inner) = params_src.strip_prefix('(') {
        match inner.trim_end().strip_suffix(')') {
            Some(inner) => Some((inner, params_base + 1)),
            None => return EraLineKind::Invalid("unclosed parameter list".to_owned()),
        }
    } else if let Some(inner) = params_src.strip_prefix(',') {
        Some((inner, params_base + 1))
    } else if params_src.is_empty() {
        None
    } else {
        return EraLineKind::Invalid(format!("unexpected `{params_src}` after function name"));
    };
    if let Some((src, base)) = params {
        if let Err(e) = parse_params(&mut label, src, base, ctx, lookup) {
            return EraLineKind::Invalid(format!("invalid parameter list: {}", e.msg));
        }
        if label.is_event() && !label.params.is_empty() {
            label.error = Some("event functions cannot take parameters".to_owned());
        }
    }
    EraLineKind::FunctionLabel(Box::new(label))
}

fn parse_params(
    label: &mut EraFunctionLabel,
    src: &str,
    base: u32,
    ctx: EraExprCtx,
    lookup: &dyn Fn(&str, &[i64]) -> Option<ScalarValue>,
) -> ParseResult<()> {
    let tokens = ctx.tokenize(src, base)?;
    let mut parser = EraExprParser::new(&tokens, ctx);
    if parser.at_end() {
        return Ok(());
    }
    let interp = EraInterpreter::new(lookup);
    loop {
        let var = parser.var_ref()?;
        let default = if parser.try_eat(EraTokenKind::Assign).is_some() {
            let expr = parser.expression()?;
            let value = interp
                .interpret_expression(&expr)
                .map_err(|e| EraParseError::new(e.span(), e.message()))?;
            Some(value)
        } else {
            None
        };
        label.params.push(var);
        label.defaults.push(default);
        if parser.try_eat(EraTokenKind::Comma).is_none() {
            break;
        }
    }
    parser.expect_end()
}

/// Parses an instruction line. `diag` receives compatibility warnings.
pub fn parse_line(
    text: &str,
    loc: SrcLoc,
    ctx: EraExprCtx,
    diag: &mut Diagnostic,
) -> EraLineKind {
    let col = loc.col;
    // `+`/`-` must be `++`/`--`
    if let Some(c) = text.chars().next().filter(|c| matches!(c, '+' | '-')) {
        let doubled = text[1..].starts_with(c);
        if !doubled {
            diag.set_category(EraDiagCategory::Syntax).span_warn(
                ArcStr::new(),
                loc,
                format!("`{c}` must be doubled to form `{c}{c}`; line ignored"),
            );
            let mut inst = EraInstruction::new(EraCmd::Set, ArcStr::from(text), col);
            inst.arg = Some(EraCmdArg::Empty);
            return EraLineKind::Instruction(Box::new(inst));
        }
        let inst = EraInstruction::new(EraCmd::Set, ArcStr::from(text), col);
        return EraLineKind::Instruction(Box::new(inst));
    }

    let word_len = ident_prefix_len(text);
    let (word, rest) = text.split_at(word_len);
    if let Some(cmd) = EraCmd::from_name(word) {
        let inst = EraInstruction::new(cmd, ArcStr::from(rest), col + word_len as u32);
        return EraLineKind::Instruction(Box::new(inst));
    }

    // Fall back to an assignment
    let (head, op) = match lex_assign_head(text, col, ctx) {
        Ok(x) => x,
        Err(e) => return EraLineKind::Invalid(e.msg),
    };
    let mut parser = EraExprParser::new(&head, ctx);
    let is_prefix = parser.at_end()
        && op
            .as_ref()
            .is_some_and(|x| matches!(x.kind, EraTokenKind::Increment | EraTokenKind::Decrement));
    if !is_prefix {
        if let Err(e) = parser.var_ref().and_then(|_| parser.expect_end()) {
            return EraLineKind::Invalid(format!("unknown command `{word}` ({})", e.msg));
        }
    }
    let Some(op) = op else {
        return EraLineKind::Invalid(format!("unknown command or assignment `{word}`"));
    };
    if op.kind == EraTokenKind::CmpEq {
        diag.set_category(EraDiagCategory::Style).span_warn_level(
            ArcStr::new(),
            at(loc, op.span),
            0,
            "`==` used as assignment; treated as `=`",
        );
    }
    let inst = EraInstruction::new(EraCmd::Set, ArcStr::from(text), col);
    EraLineKind::Instruction(Box::new(inst))
}

fn at(loc: SrcLoc, span: SrcSpan) -> SrcLoc {
    SrcLoc::new(loc.line, span.start().0)
}

/// Lexes `text` up to the first assignment-like operator, which is returned
/// separately. The text after the operator is left unlexed since string
/// assignments take it verbatim.
fn lex_assign_head(
    text: &str,
    base: u32,
    ctx: EraExprCtx,
) -> ParseResult<(Vec<EraToken>, Option<EraToken>)> {
    let mut lexer = EraLexer::new(text, ctx.defines, ctx.ignore_case).with_base(base);
    let mut head = Vec::new();
    let mut op = None;
    let eof_span = loop {
        let token = lexer.next_token();
        match token.kind {
            EraTokenKind::Eof => break token.span,
            EraTokenKind::Increment | EraTokenKind::Decrement | EraTokenKind::CmpEq => {
                let span = SrcSpan::new(token.span.end(), 0);
                op = Some(token);
                break span;
            }
            kind if kind.is_assign_op() => {
                let span = SrcSpan::new(token.span.end(), 0);
                op = Some(token);
                break span;
            }
            _ => head.push(token),
        }
    };
    if let Some(e) = lexer.take_errors().into_iter().next() {
        return Err(parse_err(e.span, e.msg));
    }
    head.push(EraToken {
        kind: EraTokenKind::Eof,
        span: eof_span,
        text: ArcStr::new(),
        int_value: 0,
        is_replaced: false,
    });
    Ok((head, op))
}

/// What a sharp line asks the loader to do besides updating the label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EraSharpOutcome {
    Applied,
    Ignored,
}

/// Applies a `#...` line (text after `#`) to the function label above it.
pub fn parse_sharp_line(
    label: &mut EraFunctionLabel,
    text: &str,
    loc: SrcLoc,
    filename: &ArcStr,
    ctx: EraExprCtx,
    lookup: &dyn Fn(&str, &[i64]) -> Option<ScalarValue>,
    diag: &mut Diagnostic,
) -> EraSharpOutcome {
    #[derive(Clone, Copy, PartialEq, Eq)]
    enum Sharp {
        Single,
        Later,
        Pri,
        Only,
        Function,
        FunctionS,
        LocalSize,
        LocalSSize,
        Dim,
        DimS,
    }

    diag.set_category(EraDiagCategory::Label);
    let kw_len = ident_prefix_len(text);
    let (keyword, args) = text.split_at(kw_len);
    let args_base = loc.col + 1 + kw_len as u32 + leading_blank_len(args) as u32;
    let args = args.trim();
    let Some(sharp) = bmatch_caseless!(keyword.as_bytes();
        b"SINGLE" => Some(Sharp::Single),
        b"LATER" => Some(Sharp::Later),
        b"PRI" => Some(Sharp::Pri),
        b"ONLY" => Some(Sharp::Only),
        b"FUNCTION" => Some(Sharp::Function),
        b"FUNCTIONS" => Some(Sharp::FunctionS),
        b"LOCALSIZE" => Some(Sharp::LocalSize),
        b"LOCALSSIZE" => Some(Sharp::LocalSSize),
        b"DIM" => Some(Sharp::Dim),
        b"DIMS" => Some(Sharp::DimS),
        _ => None,
    ) else {
        diag.span_warn(ArcStr::new(), loc, format!("unknown directive `#{keyword}`; ignored"));
        return EraSharpOutcome::Ignored;
    };

    let event_flags = EraFuncFlags::IS_SINGLE | EraFuncFlags::IS_PRI | EraFuncFlags::IS_LATER;
    match sharp {
        Sharp::Single | Sharp::Later | Sharp::Pri | Sharp::Only => {
            if !label.is_event() {
                diag.span_warn(
                    ArcStr::new(),
                    loc,
                    format!("#{keyword} only applies to event functions; ignored"),
                );
                return EraSharpOutcome::Ignored;
            }
            let flag = match sharp {
                Sharp::Single => EraFuncFlags::IS_SINGLE,
                Sharp::Later => EraFuncFlags::IS_LATER,
                Sharp::Pri => EraFuncFlags::IS_PRI,
                _ => EraFuncFlags::IS_ONLY,
            };
            if label.flags.contains(flag) {
                diag.span_warn(ArcStr::new(), loc, format!("duplicate #{keyword}"));
                return EraSharpOutcome::Ignored;
            }
            if flag == EraFuncFlags::IS_ONLY {
                if label.flags.intersects(event_flags) {
                    diag.span_warn(
                        ArcStr::new(),
                        loc,
                        "#ONLY overrides #SINGLE, #PRI and #LATER",
                    );
                }
                label.flags.remove(event_flags);
            } else if label.flags.contains(EraFuncFlags::IS_ONLY) {
                diag.span_warn(
                    ArcStr::new(),
                    loc,
                    format!("#{keyword} has no effect on an #ONLY function"),
                );
                return EraSharpOutcome::Ignored;
            }
            label.flags |= flag;
        }
        Sharp::Function | Sharp::FunctionS => {
            if label.is_event() {
                diag.span_err(
                    ArcStr::new(),
                    loc,
                    format!("event functions cannot be declared #{keyword}"),
                );
                return EraSharpOutcome::Ignored;
            }
            if label.flags.intersects(event_flags | EraFuncFlags::IS_ONLY) {
                diag.span_err(
                    ArcStr::new(),
                    loc,
                    format!("#{keyword} cannot be combined with event priorities"),
                );
                return EraSharpOutcome::Ignored;
            }
            if label.is_method() {
                diag.span_warn(ArcStr::new(), loc, "function is already declared as a method");
                return EraSharpOutcome::Ignored;
            }
            label.flags |= EraFuncFlags::IS_METHOD;
            label.method_kind = Some(if sharp == Sharp::FunctionS {
                ScalarValueKind::Str
            } else {
                ScalarValueKind::Int
            });
            label.depth = 0;
        }
        Sharp::LocalSize | Sharp::LocalSSize => {
            let slot = if sharp == Sharp::LocalSize {
                &mut label.local_size
            } else {
                &mut label.locals_size
            };
            if slot.is_some() {
                diag.span_warn(ArcStr::new(), loc, format!("duplicate #{keyword}; ignored"));
                return EraSharpOutcome::Ignored;
            }
            let size = ctx
                .parse_expr(args, args_base)
                .map_err(|e| e.msg)
                .and_then(|expr| {
                    EraInterpreter::new(lookup)
                        .interpret_int(&expr, expr.span())
                        .map_err(|e| e.message())
                });
            match size {
                Ok(size) if size > 0 && size <= u32::MAX as i64 => *slot = Some(size as u32),
                Ok(size) => {
                    diag.span_err(ArcStr::new(), loc, format!("invalid #{keyword} {size}"));
                    return EraSharpOutcome::Ignored;
                }
                Err(e) => {
                    diag.span_err(ArcStr::new(), loc, format!("#{keyword}: {e}"));
                    return EraSharpOutcome::Ignored;
                }
            }
        }
        Sharp::Dim | Sharp::DimS => {
            let is_string = sharp == Sharp::DimS;
            let decl = parse_dim_decl(args, args_base, ctx.ignore_case).and_then(
                |(flags, name, name_span, rest, rest_base)| {
                    let decl = EraDimDecl {
                        filename: filename.clone(),
                        loc,
                        is_string,
                        flags,
                        name,
                        name_span,
                        rest,
                        rest_base,
                    };
                    resolve_dim(&decl, ctx, lookup).map_err(|e| match e {
                        EraInterpretError::VarNotFound(..) => (e.span(), e.message()),
                        EraInterpretError::Others(span, msg) => (span, msg),
                    })
                },
            );
            match decl {
                Ok(decl) => {
                    if decl.is_ref() && !label.params.iter().any(|x| x.name == decl.name) {
                        diag.span_warn(
                            ArcStr::new(),
                            loc,
                            format!("REF variable `{}` is not a parameter", decl.name),
                        );
                    }
                    label.private_decls.push(decl);
                }
                Err((span, msg)) => {
                    diag.span_err(ArcStr::new(), at(loc, span), msg);
                    return EraSharpOutcome::Ignored;
                }
            }
        }
    }
    EraSharpOutcome::Applied
}

fn parse_err(span: SrcSpan, msg: impl Into<String>) -> EraParseError {
    EraParseError::new(span, msg)
}

/// Finds the first top-level `,` or `(` in a form string, skipping
/// interpolations.
fn split_form_target(text: &str) -> usize {
    let bytes = text.as_bytes();
    let (mut brace, mut in_percent, mut in_str) = (0usize, false, false);
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => i += 1,
            b'"' if brace > 0 || in_percent => in_str = !in_str,
            _ if in_str => (),
            b'{' => brace += 1,
            b'}' => brace = brace.saturating_sub(1),
            b'%' if brace == 0 => in_percent = !in_percent,
            b',' | b'(' if brace == 0 && !in_percent => return i,
            _ => (),
        }
        i += 1;
    }
    text.len()
}

/// Parses the `, args` or `(args)` tail of a call.
fn parse_call_args(tail: &str, base: u32, ctx: EraExprCtx) -> ParseResult<Vec<Option<EraExpr>>> {
    let trimmed = tail.trim_start();
    let base = base + leading_blank_len(tail) as u32;
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    if let Some(inner) = trimmed.strip_prefix(',') {
        return ctx.parse_expr_list(inner, base + 1);
    }
    if let Some(inner) = trimmed.strip_prefix('(') {
        let Some(inner) = inner.trim_end().strip_suffix(')') else {
            return Err(parse_err(
                SrcSpan::new(SrcPos(base), trimmed.len() as u32),
                "unclosed argument list",
            ));
        };
        return ctx.parse_expr_list(inner, base + 1);
    }
    Err(parse_err(
        SrcSpan::new(SrcPos(base), trimmed.len() as u32),
        format!("unexpected `{trimmed}` after call target"),
    ))
}

fn required_vars(
    list: Vec<Option<EraExpr>>,
    span: SrcSpan,
    what: &str,
) -> ParseResult<Vec<EraExpr>> {
    list.into_iter()
        .map(|x| x.ok_or_else(|| parse_err(span, format!("{what}: argument cannot be omitted"))))
        .collect()
}

fn into_var(expr: EraExpr, what: &str) -> ParseResult<EraVarRef> {
    match expr {
        EraExpr::Var(var) => Ok(var),
        other => Err(parse_err(other.span(), format!("{what} expects a variable"))),
    }
}

/// Parses the raw argument of an instruction into its typed form.
/// `kind_of` reports the type of a variable visible from the function.
pub fn materialize_arg(
    inst: &EraInstruction,
    ctx: EraExprCtx,
    kind_of: &dyn Fn(&str) -> Option<ScalarValueKind>,
) -> ParseResult<EraCmdArg> {
    let cmd = inst.cmd;
    let raw: &str = &inst.raw_arg;
    let base = inst.raw_base;
    let trimmed = raw.trim();
    let trimmed_base = base + leading_blank_len(raw) as u32;
    let whole_span = SrcSpan::new(SrcPos(base), raw.len() as u32);
    let name = cmd.name();

    Ok(match cmd.arg_format() {
        EraArgFormat::None => {
            if !trimmed.is_empty() {
                return Err(parse_err(whole_span, format!("{name} takes no argument")));
            }
            EraCmdArg::Empty
        }
        EraArgFormat::RawText => {
            let (text, _) = strip_one_blank(raw);
            EraCmdArg::Text(ArcStr::from(text))
        }
        EraArgFormat::Form => {
            let (text, skip) = strip_one_blank(raw);
            EraCmdArg::Form(ctx.parse_form(text, base + skip)?)
        }
        EraArgFormat::Expr => {
            if trimmed.is_empty() {
                return Err(parse_err(whole_span, format!("{name} expects an argument")));
            }
            EraCmdArg::Expr(ctx.parse_expr(trimmed, trimmed_base)?)
        }
        EraArgFormat::OptExpr => {
            if trimmed.is_empty() {
                EraCmdArg::Empty
            } else {
                EraCmdArg::Expr(ctx.parse_expr(trimmed, trimmed_base)?)
            }
        }
        EraArgFormat::ExprList => {
            if trimmed.is_empty() {
                EraCmdArg::ExprList(Vec::new())
            } else {
                let list = ctx.parse_expr_list(trimmed, trimmed_base)?;
                EraCmdArg::ExprList(required_vars(list, whole_span, name)?)
            }
        }
        EraArgFormat::Assign => materialize_assign(raw, base, ctx, kind_of)?,
        EraArgFormat::VarSet => {
            let list = required_vars(ctx.parse_expr_list(trimmed, trimmed_base)?, whole_span, name)?;
            let mut it = list.into_iter();
            let var = it
                .next()
                .ok_or_else(|| parse_err(whole_span, "VARSET expects a variable"))?;
            let var = into_var(var, name)?;
            let value = it.next();
            if let Some(extra) = it.next() {
                return Err(parse_err(extra.span(), "too many arguments to VARSET"));
            }
            EraCmdArg::VarSet { var, value }
        }
        EraArgFormat::Swap => {
            let list = required_vars(ctx.parse_expr_list(trimmed, trimmed_base)?, whole_span, name)?;
            let [a, b]: [EraExpr; 2] = list
                .try_into()
                .map_err(|_| parse_err(whole_span, "SWAP expects two variables"))?;
            EraCmdArg::Swap(into_var(a, name)?, into_var(b, name)?)
        }
        EraArgFormat::For => {
            let list = ctx.parse_expr_list(trimmed, trimmed_base)?;
            if !(3..=4).contains(&list.len()) {
                return Err(parse_err(whole_span, "FOR expects 3 or 4 arguments"));
            }
            let mut it = list.into_iter();
            let mut next = |what: &str| {
                it.next()
                    .flatten()
                    .ok_or_else(|| parse_err(whole_span, format!("FOR: missing {what}")))
            };
            let var = into_var(next("counter")?, name)?;
            let start = next("start value")?;
            let end = next("end value")?;
            let step = next("step").ok();
            EraCmdArg::For {
                var,
                start,
                end,
                step,
            }
        }
        EraArgFormat::Case => EraCmdArg::Case(materialize_case(trimmed, trimmed_base, ctx)?),
        EraArgFormat::CallName | EraArgFormat::GotoName => {
            let name_len = ident_prefix_len(trimmed);
            let (target, tail) = trimmed.split_at(name_len);
            check_ident(target).map_err(|e| parse_err(whole_span, e))?;
            let target = EraCallTarget::Name(normalize_ident(target, ctx.ignore_case));
            let tail_base = trimmed_base + name_len as u32;
            if cmd.arg_format() == EraArgFormat::GotoName {
                if !tail.trim().is_empty() {
                    return Err(parse_err(whole_span, format!("{name} takes only a label")));
                }
                EraCmdArg::Goto(target)
            } else {
                EraCmdArg::Call {
                    target,
                    args: parse_call_args(tail, tail_base, ctx)?,
                }
            }
        }
        EraArgFormat::CallForm | EraArgFormat::GotoForm => {
            let split = split_form_target(trimmed);
            let (form_src, tail) = trimmed.split_at(split);
            let form = ctx.parse_form(form_src.trim_end(), trimmed_base)?;
            let target = match form.as_const_text() {
                Some(text) => EraCallTarget::Name(normalize_ident(text.trim(), ctx.ignore_case)),
                None => EraCallTarget::Form(form),
            };
            if let EraCallTarget::Name(name) = &target {
                check_ident(name).map_err(|e| parse_err(whole_span, e))?;
            }
            if cmd.arg_format() == EraArgFormat::GotoForm {
                if !tail.trim().is_empty() {
                    return Err(parse_err(whole_span, format!("{name} takes only a label")));
                }
                EraCmdArg::Goto(target)
            } else {
                EraCmdArg::Call {
                    target,
                    args: parse_call_args(tail, trimmed_base + split as u32, ctx)?,
                }
            }
        }
        EraArgFormat::Begin => {
            let kind = trimmed.parse().map_err(|_| {
                parse_err(whole_span, format!("unknown BEGIN keyword `{trimmed}`"))
            })?;
            EraCmdArg::Begin(kind)
        }
        EraArgFormat::OptVar => {
            if trimmed.is_empty() {
                EraCmdArg::Var(None)
            } else {
                let tokens = ctx.tokenize(trimmed, trimmed_base)?;
                let mut parser = EraExprParser::new(&tokens, ctx);
                let var = parser.var_ref()?;
                parser.expect_end()?;
                EraCmdArg::Var(Some(var))
            }
        }
    })
}

fn materialize_assign(
    raw: &str,
    base: u32,
    ctx: EraExprCtx,
    kind_of: &dyn Fn(&str) -> Option<ScalarValueKind>,
) -> ParseResult<EraCmdArg> {
    let (head, op) = lex_assign_head(raw, base, ctx)?;
    let Some(op) = op else {
        let span = SrcSpan::new(SrcPos(base), raw.len() as u32);
        return Err(parse_err(span, "expected assignment operator"));
    };
    let rest_base = op.span.end().0;
    let rest = raw
        .get((rest_base - base) as usize..)
        .unwrap_or_default();
    let step_op = match op.kind {
        EraTokenKind::Increment => Some(EraBinaryOp::Add),
        EraTokenKind::Decrement => Some(EraBinaryOp::Sub),
        _ => None,
    };
    let one = EraExpr::Int(1, op.span);

    let mut parser = EraExprParser::new(&head, ctx);
    if parser.at_end() {
        // Prefix `++X` / `--X`
        let Some(step_op) = step_op else {
            return Err(parse_err(op.span, "assignment without a target"));
        };
        let tokens = ctx.tokenize(rest, rest_base)?;
        let mut parser = EraExprParser::new(&tokens, ctx);
        let lhs = parser.var_ref()?;
        parser.expect_end()?;
        return Ok(EraCmdArg::Assign {
            lhs,
            op: Some(step_op),
            rhs: one,
        });
    }
    let lhs = parser.var_ref()?;
    parser.expect_end()?;

    let rest_trimmed = rest.trim();
    let rest_trimmed_base = rest_base + leading_blank_len(rest) as u32;
    let (op, rhs) = match op.kind {
        EraTokenKind::Increment | EraTokenKind::Decrement => {
            if !rest_trimmed.is_empty() {
                return Err(parse_err(
                    SrcSpan::new(SrcPos(rest_trimmed_base), rest_trimmed.len() as u32),
                    "unexpected text after increment",
                ));
            }
            (step_op, one)
        }
        EraTokenKind::Assign | EraTokenKind::CmpEq
            if kind_of(&lhs.name) == Some(ScalarValueKind::Str) =>
        {
            // String assignment takes the rest of the line as a form string
            let (rest, skip) = strip_one_blank(rest);
            let start = rest_base + skip;
            let form = ctx.parse_form(rest, start)?;
            let span = SrcSpan::new(SrcPos(start), rest.len() as u32);
            (None, EraExpr::Form(Box::new(form), span))
        }
        EraTokenKind::Assign | EraTokenKind::CmpEq | EraTokenKind::ExprAssign => {
            (None, ctx.parse_expr(rest_trimmed, rest_trimmed_base)?)
        }
        kind => {
            let Some(op) = EraBinaryOp::from_assign_token(kind) else {
                return Err(parse_err(
                    op.span,
                    format!("expected assignment operator, found {kind}"),
                ));
            };
            (Some(op), ctx.parse_expr(rest_trimmed, rest_trimmed_base)?)
        }
    };
    Ok(EraCmdArg::Assign { lhs, op, rhs })
}

fn materialize_case(src: &str, base: u32, ctx: EraExprCtx) -> ParseResult<Vec<EraCaseItem>> {
    let tokens = ctx.tokenize(src, base)?;
    let mut parser = EraExprParser::new(&tokens, ctx);
    let mut items = Vec::new();
    loop {
        if parser.try_eat_keyword("IS") {
            let op_token = parser.bump();
            let op = match op_token.kind {
                EraTokenKind::CmpEq
                | EraTokenKind::CmpNEq
                | EraTokenKind::CmpLT
                | EraTokenKind::CmpGT
                | EraTokenKind::CmpLEq
                | EraTokenKind::CmpGEq
                | EraTokenKind::BitAnd => EraBinaryOp::from_token(op_token.kind),
                _ => None,
            };
            let op = op.ok_or_else(|| {
                parse_err(op_token.span, "expected comparison operator in CASE")
            })?;
            items.push(EraCaseItem::Cond(op, parser.expression()?));
        } else {
            let value = parser.expression()?;
            if parser.try_eat_keyword("TO") {
                items.push(EraCaseItem::Range(value, parser.expression()?));
            } else {
                items.push(EraCaseItem::Value(value));
            }
        }
        if parser.try_eat(EraTokenKind::Comma).is_none() {
            break;
        }
    }
    parser.expect_end()?;
    if items.is_empty() {
        return Err(parse_err(SrcSpan::new(SrcPos(base), 0), "CASE expects a value"));
    }
    Ok(items)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::EraFormPart;

    fn no_consts(_: &str, _: &[i64]) -> Option<ScalarValue> {
        None
    }

    fn ctx() -> EraExprCtx<'static> {
        EraExprCtx::new(None, true)
    }

    fn func(kind: EraLineKind) -> EraFunctionLabel {
        match kind {
            EraLineKind::FunctionLabel(x) => *x,
            other => panic!("expected a function label, got {other:?}"),
        }
    }

    fn inst(kind: EraLineKind) -> EraInstruction {
        match kind {
            EraLineKind::Instruction(x) => *x,
            other => panic!("expected an instruction, got {other:?}"),
        }
    }

    #[test]
    fn hook_names_are_classified_caselessly() {
        assert!(is_event_function("eventTrain"));
        assert!(!is_event_function("EVENTTRAINX"));
        assert!(is_system_function("show_status"));
        assert!(is_system_function("COM_ABLE12"));
        assert!(is_system_function("com7"));
        assert!(!is_system_function("COM"));
        assert!(!is_system_function("COMX1"));
        assert!(!is_system_function("ABLUP１"));
    }

    #[test]
    fn label_lines() {
        let label = func(parse_label_line("@f(A, B = 5)", 0, ctx(), &no_consts));
        assert_eq!(label.name, "F");
        assert_eq!(label.params.len(), 2);
        assert_eq!(label.defaults, vec![None, Some(ScalarValue::Int(5))]);

        let label = func(parse_label_line("@EVENTTRAIN", 0, ctx(), &no_consts));
        assert!(label.is_event());
        let label = func(parse_label_line("@COM_ABLE12", 0, ctx(), &no_consts));
        assert!(label.flags.contains(EraFuncFlags::IS_SYSTEM));
        let label = func(parse_label_line("@EVENTSHOP, X", 0, ctx(), &no_consts));
        assert!(label.error.is_some());

        assert!(matches!(
            parse_label_line("$LOOP_TOP", 0, ctx(), &no_consts),
            EraLineKind::GotoLabel(name) if name == "LOOP_TOP"
        ));
        for bad in ["@1ABC", "@PRINT", "@F(A", "@F X", "$A B"] {
            assert!(
                matches!(parse_label_line(bad, 0, ctx(), &no_consts), EraLineKind::Invalid(_)),
                "{bad} should be invalid"
            );
        }
    }

    #[test]
    fn instruction_lines() {
        let mut diag = Diagnostic::new();
        let loc = SrcLoc::new(1, 0);
        let line = inst(parse_line("printform Hello", loc, ctx(), &mut diag));
        assert_eq!(line.cmd, EraCmd::PrintForm);
        assert_eq!(&*line.raw_arg, " Hello");

        let line = inst(parse_line("COUNT:1 += 2", loc, ctx(), &mut diag));
        assert_eq!(line.cmd, EraCmd::Set);
        assert!(line.arg.is_none());

        let line = inst(parse_line("+X", loc, ctx(), &mut diag));
        assert_eq!(line.arg, Some(EraCmdArg::Empty));
        assert_eq!(diag.entries().len(), 1);

        let _ = inst(parse_line("X == 3", loc, ctx(), &mut diag));
        assert_eq!(diag.entries().len(), 2);
        assert_eq!(diag.entries()[1].category, EraDiagCategory::Style);

        assert!(matches!(
            parse_line("FOO BAR", loc, ctx(), &mut diag),
            EraLineKind::Invalid(_)
        ));
    }

    #[test]
    fn sharp_lines() {
        let mut diag = Diagnostic::new();
        let loc = SrcLoc::new(2, 0);
        let file = ArcStr::new();
        let mut event = func(parse_label_line("@EVENTTURNEND", 0, ctx(), &no_consts));
        for text in ["SINGLE", "PRI", "ONLY", "LATER"] {
            parse_sharp_line(&mut event, text, loc, &file, ctx(), &no_consts, &mut diag);
        }
        assert_eq!(event.flags & EraFuncFlags::IS_ONLY, EraFuncFlags::IS_ONLY);
        assert!(!event.flags.intersects(EraFuncFlags::IS_SINGLE | EraFuncFlags::IS_PRI));
        // `ONLY` overriding and the ignored `LATER`
        assert_eq!(diag.entries().len(), 2);
        let outcome = parse_sharp_line(&mut event, "FUNCTION", loc, &file, ctx(), &no_consts, &mut diag);
        assert_eq!(outcome, EraSharpOutcome::Ignored);
        assert!(diag.has_error());

        let mut diag = Diagnostic::new();
        let mut method = func(parse_label_line("@SQUARE(X)", 0, ctx(), &no_consts));
        for text in ["FUNCTION", "LOCALSIZE 4 * 2", "DIMS NAME, 3", "DIM DYNAMIC BUF = 1"] {
            let outcome = parse_sharp_line(&mut method, text, loc, &file, ctx(), &no_consts, &mut diag);
            assert_eq!(outcome, EraSharpOutcome::Applied, "{text}");
        }
        assert!(diag.is_empty());
        assert_eq!(method.method_kind, Some(ScalarValueKind::Int));
        assert_eq!(method.depth, 0);
        assert_eq!(method.local_size, Some(8));
        assert_eq!(method.private_decls.len(), 2);
        assert_eq!(method.private_decls[1].init, vec![ScalarValue::Int(1)]);
    }

    #[test]
    fn argument_materialization() -> anyhow::Result<()> {
        let kind_of = |name: &str| match name {
            "STR" | "NAME" => Some(ScalarValueKind::Str),
            _ => Some(ScalarValueKind::Int),
        };
        let mut diag = Diagnostic::new();
        let loc = SrcLoc::new(1, 0);
        let mat = |text: &str, diag: &mut Diagnostic| {
            let line = inst(parse_line(text, loc, ctx(), diag));
            materialize_arg(&line, ctx(), &kind_of)
        };

        let arg = mat("NAME = Hi {1+1}", &mut diag)?;
        let EraCmdArg::Assign { op: None, rhs: EraExpr::Form(form, _), .. } = arg else {
            panic!("expected a form assignment, got {arg:?}");
        };
        assert_eq!(form.parts[0], EraFormPart::Text("Hi ".to_owned()));

        let arg = mat("X++", &mut diag)?;
        assert!(matches!(arg, EraCmdArg::Assign { op: Some(EraBinaryOp::Add), .. }));

        let arg = mat("CALL TARGET(1, , 3)", &mut diag)?;
        let EraCmdArg::Call { target: EraCallTarget::Name(name), args } = arg else {
            panic!("expected a call");
        };
        assert_eq!(name, "TARGET");
        assert_eq!(args.len(), 3);
        assert!(args[1].is_none());

        let arg = mat("CALLFORM COM{X}, 7", &mut diag)?;
        assert!(matches!(
            arg,
            EraCmdArg::Call { target: EraCallTarget::Form(_), ref args } if args.len() == 1
        ));
        let arg = mat("CALLFORM SHOP", &mut diag)?;
        assert!(matches!(arg, EraCmdArg::Call { target: EraCallTarget::Name(_), .. }));

        let arg = mat("CASE 1, 3 TO 5, IS > 10", &mut diag)?;
        let EraCmdArg::Case(items) = arg else {
            panic!("expected CASE items");
        };
        assert!(matches!(items[1], EraCaseItem::Range(..)));
        assert!(matches!(items[2], EraCaseItem::Cond(EraBinaryOp::Gt, _)));

        let arg = mat("FOR COUNT, 0, 10", &mut diag)?;
        assert!(matches!(arg, EraCmdArg::For { step: None, .. }));
        assert!(mat("FOR 1, 0, 10", &mut diag).is_err());
        assert!(mat("ENDIF X", &mut diag).is_err());
        assert!(mat("BEGIN NOWHERE", &mut diag).is_err());
        Ok(())
    }
}
