use arcstr::ArcStr;
use enumset::EnumSet;

use crate::{
    lexer::{EraLexer, EraToken, EraTokenKind},
    types::*,
};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{msg}")]
pub struct EraParseError {
    pub span: SrcSpan,
    pub msg: String,
}

impl EraParseError {
    pub fn new(span: SrcSpan, msg: impl Into<String>) -> Self {
        EraParseError {
            span,
            msg: msg.into(),
        }
    }
}

pub type ParseResult<T> = Result<T, EraParseError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum EraUnaryOp {
    Neg,
    Pos,
    Not,
    BitNot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum EraBinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    BitAnd,
    BitOr,
    BitXor,
    Shl,
    Shr,
    And,
    Or,
    Nand,
    Nor,
    Eq,
    NEq,
    Lt,
    Gt,
    LEq,
    GEq,
}

impl EraBinaryOp {
    pub fn from_token(kind: EraTokenKind) -> Option<Self> {
        use EraTokenKind as T;
        Some(match kind {
            T::Plus => Self::Add,
            T::Minus => Self::Sub,
            T::Multiply => Self::Mul,
            T::Divide => Self::Div,
            T::Percentage => Self::Rem,
            T::BitAnd => Self::BitAnd,
            T::BitOr => Self::BitOr,
            T::BitXor => Self::BitXor,
            T::BitShiftL => Self::Shl,
            T::BitShiftR => Self::Shr,
            T::LogicalAnd => Self::And,
            T::LogicalOr => Self::Or,
            T::LogicalNand => Self::Nand,
            T::LogicalNor => Self::Nor,
            T::CmpEq => Self::Eq,
            T::CmpNEq => Self::NEq,
            T::CmpLT => Self::Lt,
            T::CmpGT => Self::Gt,
            T::CmpLEq => Self::LEq,
            T::CmpGEq => Self::GEq,
            _ => return None,
        })
    }

    /// Maps a compound assignment operator to its arithmetic counterpart.
    pub fn from_assign_token(kind: EraTokenKind) -> Option<Self> {
        use EraTokenKind as T;
        Some(match kind {
            T::PlusAssign => Self::Add,
            T::MinusAssign => Self::Sub,
            T::MultiplyAssign => Self::Mul,
            T::DivideAssign => Self::Div,
            T::PercentAssign => Self::Rem,
            T::BitAndAssign => Self::BitAnd,
            T::BitOrAssign => Self::BitOr,
            T::BitXorAssign => Self::BitXor,
            T::BitShiftLAssign => Self::Shl,
            T::BitShiftRAssign => Self::Shr,
            _ => return None,
        })
    }
}

/// A variable term such as `FLAG:3` or `LOCAL:ARG:1`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EraVarRef {
    pub name: ArcStr,
    pub indices: Vec<EraExpr>,
    pub span: SrcSpan,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EraExpr {
    Int(i64, SrcSpan),
    Str(ArcStr, SrcSpan),
    Form(Box<EraFormString>, SrcSpan),
    Var(EraVarRef),
    Call {
        name: ArcStr,
        args: Vec<Option<EraExpr>>,
        span: SrcSpan,
    },
    Unary {
        op: EraUnaryOp,
        operand: Box<EraExpr>,
        span: SrcSpan,
    },
    Binary {
        op: EraBinaryOp,
        lhs: Box<EraExpr>,
        rhs: Box<EraExpr>,
        span: SrcSpan,
    },
    Ternary {
        cond: Box<EraExpr>,
        then: Box<EraExpr>,
        otherwise: Box<EraExpr>,
        span: SrcSpan,
    },
}

impl EraExpr {
    pub fn span(&self) -> SrcSpan {
        match self {
            EraExpr::Int(_, span)
            | EraExpr::Str(_, span)
            | EraExpr::Form(_, span)
            | EraExpr::Call { span, .. }
            | EraExpr::Unary { span, .. }
            | EraExpr::Binary { span, .. }
            | EraExpr::Ternary { span, .. } => *span,
            EraExpr::Var(var) => var.span,
        }
    }

    pub fn as_var(&self) -> Option<&EraVarRef> {
        match self {
            EraExpr::Var(var) => Some(var),
            _ => None,
        }
    }

    pub fn is_literal(&self) -> bool {
        matches!(self, EraExpr::Int(..) | EraExpr::Str(..))
    }

    /// Visits this expression and every sub-expression, including the ones
    /// inside form strings and variable indices, in pre-order.
    pub fn walk(&self, f: &mut impl FnMut(&EraExpr)) {
        f(self);
        match self {
            EraExpr::Int(..) | EraExpr::Str(..) => (),
            EraExpr::Form(form, _) => form.walk(f),
            EraExpr::Var(var) => var.indices.iter().for_each(|x| x.walk(f)),
            EraExpr::Call { args, .. } => args.iter().flatten().for_each(|x| x.walk(f)),
            EraExpr::Unary { operand, .. } => operand.walk(f),
            EraExpr::Binary { lhs, rhs, .. } => {
                lhs.walk(f);
                rhs.walk(f);
            }
            EraExpr::Ternary {
                cond,
                then,
                otherwise,
                ..
            } => {
                cond.walk(f);
                then.walk(f);
                otherwise.walk(f);
            }
        }
    }

    /// Visits every user-visible call name in the expression tree.
    pub fn for_each_call(&self, f: &mut impl FnMut(&ArcStr, SrcSpan)) {
        match self {
            EraExpr::Int(..) | EraExpr::Str(..) => (),
            EraExpr::Form(form, _) => form.for_each_call(f),
            EraExpr::Var(var) => var.indices.iter().for_each(|x| x.for_each_call(f)),
            EraExpr::Call { name, args, span } => {
                f(name, *span);
                args.iter().flatten().for_each(|x| x.for_each_call(f));
            }
            EraExpr::Unary { operand, .. } => operand.for_each_call(f),
            EraExpr::Binary { lhs, rhs, .. } => {
                lhs.for_each_call(f);
                rhs.for_each_call(f);
            }
            EraExpr::Ternary {
                cond,
                then,
                otherwise,
                ..
            } => {
                cond.for_each_call(f);
                then.for_each_call(f);
                otherwise.for_each_call(f);
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EraFormString {
    pub parts: Vec<EraFormPart>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EraFormPart {
    Text(String),
    Expr {
        expr: EraExpr,
        width: Option<EraExpr>,
        align_left: bool,
    },
    Ternary {
        cond: EraExpr,
        then: EraFormString,
        otherwise: EraFormString,
    },
}

impl EraFormString {
    pub fn from_text(text: impl Into<String>) -> Self {
        EraFormString {
            parts: vec![EraFormPart::Text(text.into())],
        }
    }

    /// Returns the text when the form contains no interpolation.
    pub fn as_const_text(&self) -> Option<String> {
        let mut out = String::new();
        for part in &self.parts {
            match part {
                EraFormPart::Text(x) => out.push_str(x),
                _ => return None,
            }
        }
        Some(out)
    }

    pub fn walk(&self, f: &mut impl FnMut(&EraExpr)) {
        for part in &self.parts {
            match part {
                EraFormPart::Text(_) => (),
                EraFormPart::Expr { expr, width, .. } => {
                    expr.walk(f);
                    if let Some(width) = width {
                        width.walk(f);
                    }
                }
                EraFormPart::Ternary {
                    cond,
                    then,
                    otherwise,
                } => {
                    cond.walk(f);
                    then.walk(f);
                    otherwise.walk(f);
                }
            }
        }
    }

    pub fn for_each_call(&self, f: &mut impl FnMut(&ArcStr, SrcSpan)) {
        for part in &self.parts {
            match part {
                EraFormPart::Text(_) => (),
                EraFormPart::Expr { expr, width, .. } => {
                    expr.for_each_call(f);
                    if let Some(width) = width {
                        width.for_each_call(f);
                    }
                }
                EraFormPart::Ternary {
                    cond,
                    then,
                    otherwise,
                } => {
                    cond.for_each_call(f);
                    then.for_each_call(f);
                    otherwise.for_each_call(f);
                }
            }
        }
    }
}

/// Settings shared by every expression parse of one load.
#[derive(Debug, Clone, Copy)]
pub struct EraExprCtx<'a> {
    pub defines: Option<&'a EraDefineScope>,
    pub ignore_case: bool,
}

impl<'a> EraExprCtx<'a> {
    pub fn new(defines: Option<&'a EraDefineScope>, ignore_case: bool) -> Self {
        EraExprCtx {
            defines,
            ignore_case,
        }
    }

    pub fn tokenize(&self, src: &str, base: u32) -> ParseResult<Vec<EraToken>> {
        let (tokens, errors) = EraLexer::new(src, self.defines, self.ignore_case)
            .with_base(base)
            .tokenize();
        match errors.into_iter().next() {
            Some(e) => Err(EraParseError::new(e.span, e.msg)),
            None => Ok(tokens),
        }
    }

    /// Parses `src` as one complete expression.
    pub fn parse_expr(&self, src: &str, base: u32) -> ParseResult<EraExpr> {
        let tokens = self.tokenize(src, base)?;
        let mut parser = EraExprParser::new(&tokens, *self);
        let expr = parser.expression()?;
        parser.expect_end()?;
        Ok(expr)
    }

    /// Parses `src` as a comma-separated list in which items may be omitted.
    pub fn parse_expr_list(&self, src: &str, base: u32) -> ParseResult<Vec<Option<EraExpr>>> {
        let tokens = self.tokenize(src, base)?;
        let mut parser = EraExprParser::new(&tokens, *self);
        let list = parser.expr_list(EraTokenKind::Eof)?;
        parser.expect_end()?;
        Ok(list)
    }

    /// Parses an unquoted form string such as the argument of `PRINTFORM`.
    pub fn parse_form(&self, src: &str, base: u32) -> ParseResult<EraFormString> {
        EraFormParser {
            ctx: *self,
            src,
            base,
        }
        .parse_until(&mut 0, &[])
    }
}

#[derive(Debug, enumset::EnumSetType)]
enum EraTerminalTokenKind {
    RParen,
    Comma,
    NumberSign,
}

use EraTerminalTokenKind as Terminal;

pub struct EraExprParser<'t, 'a> {
    tokens: &'t [EraToken],
    pos: usize,
    ctx: EraExprCtx<'a>,
}

impl<'t, 'a> EraExprParser<'t, 'a> {
    /// `tokens` must end with an `Eof` token.
    pub fn new(tokens: &'t [EraToken], ctx: EraExprCtx<'a>) -> Self {
        EraExprParser {
            tokens,
            pos: 0,
            ctx,
        }
    }

    pub fn peek(&self) -> &'t EraToken {
        let idx = self.pos.min(self.tokens.len() - 1);
        &self.tokens[idx]
    }

    pub fn peek_nth(&self, n: usize) -> &'t EraToken {
        let idx = (self.pos + n).min(self.tokens.len() - 1);
        &self.tokens[idx]
    }

    pub fn bump(&mut self) -> &'t EraToken {
        let token = self.peek();
        if token.kind != EraTokenKind::Eof {
            self.pos += 1;
        }
        token
    }

    pub fn at_end(&self) -> bool {
        self.peek().kind == EraTokenKind::Eof
    }

    pub fn try_eat(&mut self, kind: EraTokenKind) -> Option<&'t EraToken> {
        if self.peek().kind == kind {
            Some(self.bump())
        } else {
            None
        }
    }

    pub fn eat(&mut self, kind: EraTokenKind) -> ParseResult<&'t EraToken> {
        let token = self.peek();
        if token.kind == kind {
            Ok(self.bump())
        } else {
            Err(EraParseError::new(
                token.span,
                format!("expected {kind}, found {}", token.kind),
            ))
        }
    }

    /// Eats an identifier equal to `keyword` (compared caselessly).
    pub fn try_eat_keyword(&mut self, keyword: &str) -> bool {
        let token = self.peek();
        if token.kind == EraTokenKind::Identifier && token.text.eq_ignore_ascii_case(keyword) {
            self.bump();
            true
        } else {
            false
        }
    }

    pub fn expect_end(&mut self) -> ParseResult<()> {
        let token = self.peek();
        if token.kind == EraTokenKind::Eof {
            Ok(())
        } else {
            Err(EraParseError::new(
                token.span,
                format!("unexpected {} after expression", token.kind),
            ))
        }
    }

    pub fn expression(&mut self) -> ParseResult<EraExpr> {
        self.expression_bp(0, EnumSet::empty())
    }

    /// Parses a comma-separated list ending before `closer`. Empty items are
    /// kept as `None`; a completely empty list yields no items.
    pub fn expr_list(&mut self, closer: EraTokenKind) -> ParseResult<Vec<Option<EraExpr>>> {
        let mut list = Vec::new();
        if self.peek().kind == closer {
            return Ok(list);
        }
        loop {
            if matches!(self.peek().kind, EraTokenKind::Comma) || self.peek().kind == closer {
                list.push(None);
            } else {
                list.push(Some(self.expression_bp(0, Terminal::Comma.into())?));
            }
            if self.try_eat(EraTokenKind::Comma).is_none() {
                break;
            }
        }
        Ok(list)
    }

    /// Parses a variable term: an identifier followed by `:index` parts.
    pub fn var_ref(&mut self) -> ParseResult<EraVarRef> {
        let name = self.eat(EraTokenKind::Identifier)?;
        let mut var = EraVarRef {
            name: name.text.clone(),
            indices: Vec::new(),
            span: name.span,
        };
        while self.try_eat(EraTokenKind::Colon).is_some() {
            let (_, r_bp) = infix_binding_power(EraTokenKind::Colon).unwrap_or((27, 28));
            let index = self.expression_bp(r_bp, EnumSet::empty())?;
            var.span = SrcSpan::new_covering(var.span, index.span());
            var.indices.push(index);
        }
        Ok(var)
    }

    fn expression_bp(
        &mut self,
        min_bp: u8,
        terminals: EnumSet<EraTerminalTokenKind>,
    ) -> ParseResult<EraExpr> {
        let first = self.peek();
        // Read lhs
        let mut lhs = match first.kind {
            EraTokenKind::IntLiteral => {
                self.bump();
                EraExpr::Int(first.int_value, first.span)
            }
            EraTokenKind::StringLiteral => {
                self.bump();
                EraExpr::Str(first.text.clone(), first.span)
            }
            EraTokenKind::FormStringLiteral => {
                self.bump();
                // Content starts after `@"`
                let base = first.span.start().0 + 2;
                let form = EraFormParser {
                    ctx: self.ctx,
                    src: &first.text,
                    base,
                }
                .parse_until(&mut 0, &[])?;
                EraExpr::Form(Box::new(form), first.span)
            }
            EraTokenKind::LParen => {
                self.bump();
                let inner = self.expression_bp(0, Terminal::RParen.into())?;
                self.eat(EraTokenKind::RParen)?;
                inner
            }
            EraTokenKind::Identifier => {
                if self.peek_nth(1).kind == EraTokenKind::LParen {
                    self.bump();
                    self.bump();
                    let args = self.expr_list(EraTokenKind::RParen)?;
                    let end = self.eat(EraTokenKind::RParen)?;
                    EraExpr::Call {
                        name: first.text.clone(),
                        args,
                        span: SrcSpan::new_covering(first.span, end.span),
                    }
                } else {
                    EraExpr::Var(self.var_ref()?)
                }
            }
            kind => {
                // Handle prefix
                let Some(((), r_bp)) = prefix_binding_power(kind) else {
                    return Err(EraParseError::new(
                        first.span,
                        format!("unexpected token in expression: {kind}"),
                    ));
                };
                self.bump();
                let operand = self.expression_bp(r_bp, terminals)?;
                let op = match kind {
                    EraTokenKind::Minus => EraUnaryOp::Neg,
                    EraTokenKind::Plus => EraUnaryOp::Pos,
                    EraTokenKind::LogicalNot => EraUnaryOp::Not,
                    _ => EraUnaryOp::BitNot,
                };
                let span = SrcSpan::new_covering(first.span, operand.span());
                // Fold negative literals eagerly
                match (op, operand) {
                    (EraUnaryOp::Neg, EraExpr::Int(x, _)) => EraExpr::Int(x.wrapping_neg(), span),
                    (op, operand) => EraExpr::Unary {
                        op,
                        operand: Box::new(operand),
                        span,
                    },
                }
            }
        };

        loop {
            let token = self.peek();
            let terminal = match token.kind {
                EraTokenKind::RParen => Some(Terminal::RParen),
                EraTokenKind::Comma => Some(Terminal::Comma),
                EraTokenKind::NumberSign => Some(Terminal::NumberSign),
                _ => None,
            };
            if terminal.is_some_and(|x| terminals.contains(x)) {
                break;
            }

            // Handle infix
            let Some((l_bp, r_bp)) = infix_binding_power(token.kind) else {
                break;
            };
            if l_bp < min_bp {
                break;
            }
            self.bump();

            if token.kind == EraTokenKind::QuestionMark {
                let then = self.expression_bp(0, terminals | Terminal::NumberSign)?;
                self.eat(EraTokenKind::NumberSign)?;
                let otherwise = self.expression_bp(r_bp, terminals)?;
                let span = SrcSpan::new_covering(lhs.span(), otherwise.span());
                lhs = EraExpr::Ternary {
                    cond: Box::new(lhs),
                    then: Box::new(then),
                    otherwise: Box::new(otherwise),
                    span,
                };
                continue;
            }

            let Some(op) = EraBinaryOp::from_token(token.kind) else {
                return Err(EraParseError::new(
                    token.span,
                    format!("unexpected operator {} in expression", token.kind),
                ));
            };
            let rhs = self.expression_bp(r_bp, terminals)?;
            let span = SrcSpan::new_covering(lhs.span(), rhs.span());
            lhs = EraExpr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
                span,
            };
        }

        Ok(lhs)
    }
}

fn prefix_binding_power(op: EraTokenKind) -> Option<((), u8)> {
    use EraTokenKind::*;
    Some(match op {
        Plus | Minus => ((), 25),
        LogicalNot => ((), 25),
        BitNot => ((), 25),
        _ => return None,
    })
}

fn infix_binding_power(op: EraTokenKind) -> Option<(u8, u8)> {
    use EraTokenKind::*;
    Some(match op {
        QuestionMark => (4, 3), // Ternary conditional
        LogicalOr | LogicalNor => (5, 6),
        LogicalAnd | LogicalNand => (7, 8),
        BitOr => (9, 10),
        BitXor => (11, 12),
        BitAnd => (13, 14),
        CmpEq | CmpNEq => (15, 16),
        CmpLT | CmpLEq | CmpGT | CmpGEq => (17, 18),
        BitShiftL | BitShiftR => (19, 20),
        Plus | Minus => (21, 22),
        Multiply | Divide | Percentage => (23, 24),
        Colon => (27, 28), // Array subscripting
        _ => return None,
    })
}

/// Character-level parser for form strings. Interpolated parts are handed to
/// the expression parser.
struct EraFormParser<'s, 'a> {
    ctx: EraExprCtx<'a>,
    src: &'s str,
    base: u32,
}

impl EraFormParser<'_, '_> {
    fn span(&self, start: usize, end: usize) -> SrcSpan {
        SrcSpan::new(SrcPos(self.base + start as u32), (end - start) as u32)
    }

    /// Parses from `*pos` until one of `stops` is found at nesting depth 0 (the
    /// stop itself is not consumed) or the end of input.
    fn parse_until(&self, pos: &mut usize, stops: &[&str]) -> ParseResult<EraFormString> {
        let bytes = self.src.as_bytes();
        let mut form = EraFormString::default();
        let mut text = String::new();
        while *pos < bytes.len() {
            let rest = &self.src[*pos..];
            if stops.iter().any(|s| rest.starts_with(s)) {
                break;
            }
            match bytes[*pos] {
                b'\\' if rest.starts_with("\\@") => {
                    flush_text(&mut form, &mut text);
                    *pos += 2;
                    form.parts.push(self.parse_ternary(pos)?);
                }
                b'\\' => {
                    let ch = rest[1..].chars().next();
                    match ch {
                        Some('n') => text.push('\n'),
                        Some(c) => text.push(c),
                        None => (),
                    }
                    *pos += 1 + ch.map_or(0, |c| c.len_utf8());
                }
                b'{' => {
                    flush_text(&mut form, &mut text);
                    let start = *pos + 1;
                    let end = find_closing(self.src, start, b'{', b'}').ok_or_else(|| {
                        EraParseError::new(self.span(*pos, bytes.len()), "unclosed `{` in form")
                    })?;
                    form.parts.push(self.parse_interp(start, end)?);
                    *pos = end + 1;
                }
                b'%' => {
                    flush_text(&mut form, &mut text);
                    let start = *pos + 1;
                    let end = find_closing(self.src, start, 0, b'%').ok_or_else(|| {
                        EraParseError::new(self.span(*pos, bytes.len()), "unclosed `%` in form")
                    })?;
                    form.parts.push(self.parse_interp(start, end)?);
                    *pos = end + 1;
                }
                _ => {
                    let c = rest.chars().next().unwrap_or('\u{fffd}');
                    text.push(c);
                    *pos += c.len_utf8();
                }
            }
        }
        flush_text(&mut form, &mut text);
        Ok(form)
    }

    /// Parses `expr[, width[, LEFT|RIGHT]]` between `start` and `end`.
    fn parse_interp(&self, start: usize, end: usize) -> ParseResult<EraFormPart> {
        let tokens = self.ctx.tokenize(&self.src[start..end], self.base + start as u32)?;
        let mut parser = EraExprParser::new(&tokens, self.ctx);
        let expr = parser.expression_bp(0, Terminal::Comma.into())?;
        let mut width = None;
        let mut align_left = false;
        if parser.try_eat(EraTokenKind::Comma).is_some() {
            width = Some(parser.expression_bp(0, Terminal::Comma.into())?);
            if parser.try_eat(EraTokenKind::Comma).is_some() {
                if parser.try_eat_keyword("LEFT") {
                    align_left = true;
                } else if !parser.try_eat_keyword("RIGHT") {
                    let token = parser.peek();
                    return Err(EraParseError::new(token.span, "expected LEFT or RIGHT"));
                }
            }
        }
        parser.expect_end()?;
        Ok(EraFormPart::Expr {
            expr,
            width,
            align_left,
        })
    }

    /// Parses `cond ? then # otherwise \@`, with `*pos` just after the opening `\@`.
    fn parse_ternary(&self, pos: &mut usize) -> ParseResult<EraFormPart> {
        let start = *pos;
        let q = find_closing(self.src, start, 0, b'?').ok_or_else(|| {
            EraParseError::new(self.span(start, self.src.len()), "expected `?` in form ternary")
        })?;
        let cond = self
            .ctx
            .parse_expr(&self.src[start..q], self.base + start as u32)?;
        *pos = q + 1;
        let then = self.parse_until(pos, &["#", "\\@"])?;
        if !self.src[*pos..].starts_with('#') {
            return Err(EraParseError::new(
                self.span(start, *pos),
                "expected `#` in form ternary",
            ));
        }
        *pos += 1;
        let otherwise = self.parse_until(pos, &["\\@"])?;
        if !self.src[*pos..].starts_with("\\@") {
            return Err(EraParseError::new(
                self.span(start, *pos),
                "unclosed form ternary",
            ));
        }
        *pos += 2;
        Ok(EraFormPart::Ternary {
            cond,
            then: trim_form(then),
            otherwise: trim_form(otherwise),
        })
    }
}

fn flush_text(form: &mut EraFormString, text: &mut String) {
    if !text.is_empty() {
        form.parts.push(EraFormPart::Text(std::mem::take(text)));
    }
}

/// Ternary branches ignore the spaces around `?`, `#` and `\@`.
fn trim_form(mut form: EraFormString) -> EraFormString {
    if let Some(EraFormPart::Text(x)) = form.parts.first_mut() {
        *x = x.trim_start().to_owned();
    }
    if let Some(EraFormPart::Text(x)) = form.parts.last_mut() {
        *x = x.trim_end().to_owned();
    }
    form.parts
        .retain(|x| !matches!(x, EraFormPart::Text(t) if t.is_empty()));
    form
}

/// Finds `close` at nesting depth 0 starting from `start`, skipping quoted
/// strings. `open` of 0 disables nesting.
fn find_closing(src: &str, start: usize, open: u8, close: u8) -> Option<usize> {
    let bytes = src.as_bytes();
    let mut depth = 0usize;
    let mut in_str = false;
    let mut i = start;
    while i < bytes.len() {
        let b = bytes[i];
        if in_str {
            match b {
                b'\\' => i += 1,
                b'"' => in_str = false,
                _ => (),
            }
        } else if b == b'"' {
            in_str = true;
        } else if open != 0 && b == open {
            depth += 1;
        } else if b == close {
            if depth == 0 {
                return Some(i);
            }
            depth -= 1;
        }
        i += 1;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> EraExprCtx<'static> {
        EraExprCtx::new(None, true)
    }

    #[test]
    fn precedence_follows_binding_powers() -> anyhow::Result<()> {
        let expr = ctx().parse_expr("1 + 2 * 3 == 7 && A:1 < 3", 0)?;
        let EraExpr::Binary { op, lhs, rhs, .. } = expr else {
            panic!("expected binary");
        };
        assert_eq!(op, EraBinaryOp::And);
        assert!(matches!(*lhs, EraExpr::Binary { op: EraBinaryOp::Eq, .. }));
        let EraExpr::Binary { lhs, .. } = *rhs else {
            panic!("expected comparison");
        };
        let var = lhs.as_var().expect("variable");
        assert_eq!(var.name.as_str(), "A");
        assert_eq!(var.indices, vec![EraExpr::Int(1, var.indices[0].span())]);
        Ok(())
    }

    #[test]
    fn ternary_and_calls() -> anyhow::Result<()> {
        let expr = ctx().parse_expr("X ? F(1, , \"s\") # -2", 0)?;
        let EraExpr::Ternary {
            then, otherwise, ..
        } = expr
        else {
            panic!("expected ternary");
        };
        let EraExpr::Call { name, args, .. } = *then else {
            panic!("expected call");
        };
        assert_eq!(name.as_str(), "F");
        assert_eq!(args.len(), 3);
        assert!(args[1].is_none());
        assert!(matches!(*otherwise, EraExpr::Int(-2, _)));
        Ok(())
    }

    #[test]
    fn index_binds_tighter_than_arithmetic() -> anyhow::Result<()> {
        let expr = ctx().parse_expr("A:B+1", 0)?;
        assert!(matches!(expr, EraExpr::Binary { op: EraBinaryOp::Add, .. }));
        Ok(())
    }

    #[test]
    fn trailing_garbage_is_error() {
        assert!(ctx().parse_expr("1 2", 0).is_err());
        assert!(ctx().parse_expr("(1", 0).is_err());
    }

    #[test]
    fn form_parts() -> anyhow::Result<()> {
        let form = ctx().parse_form(r"Hi {A:0, 4, LEFT}%STR% \@ X ? yes # no \@!", 0)?;
        assert_eq!(form.parts.len(), 6);
        assert_eq!(form.parts[0], EraFormPart::Text("Hi ".to_owned()));
        assert!(matches!(
            &form.parts[1],
            EraFormPart::Expr {
                width: Some(_),
                align_left: true,
                ..
            }
        ));
        let EraFormPart::Ternary {
            then, otherwise, ..
        } = &form.parts[4]
        else {
            panic!("expected ternary");
        };
        assert_eq!(then.as_const_text().as_deref(), Some("yes"));
        assert_eq!(otherwise.as_const_text().as_deref(), Some("no"));
        assert_eq!(form.parts[5], EraFormPart::Text("!".to_owned()));
        Ok(())
    }

    #[test]
    fn plain_form_is_const() -> anyhow::Result<()> {
        let form = ctx().parse_form("Hello", 0)?;
        assert_eq!(form.as_const_text().as_deref(), Some("Hello"));
        assert!(ctx().parse_form("oops {1", 0).is_err());
        Ok(())
    }
}
