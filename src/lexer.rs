use std::collections::VecDeque;

use arcstr::ArcStr;
use bstr::ByteSlice;
use smallvec::SmallVec;

use crate::types::*;

/// Nested macro expansions deeper than this are reported and left unexpanded.
const MAX_MACRO_DEPTH: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum EraTokenKind {
    // ----- Misc -----
    /// The error token.
    Invalid,
    Eof,
    Identifier,
    IntLiteral,
    StringLiteral,
    /// `@"..."`; the token text holds the raw form content.
    FormStringLiteral,
    // ----- Symbols -----
    Plus,
    Minus,
    Multiply,
    Divide,
    Percentage,
    BitAnd,
    BitOr,
    BitXor,
    BitNot,
    BitShiftL,
    BitShiftR,
    LogicalNot,
    LogicalAnd,
    LogicalOr,
    LogicalNand,
    LogicalNor,
    CmpEq,
    CmpNEq,
    CmpLT,
    CmpGT,
    CmpLEq,
    CmpGEq,
    Assign,
    ExprAssign,
    PlusAssign,
    MinusAssign,
    MultiplyAssign,
    DivideAssign,
    PercentAssign,
    BitAndAssign,
    BitOrAssign,
    BitXorAssign,
    BitShiftLAssign,
    BitShiftRAssign,
    Increment,
    Decrement,
    LParen,
    RParen,
    LBrace,
    RBrace,
    Comma,
    Colon,
    QuestionMark,
    NumberSign,
    At,
    Dollar,
}

impl EraTokenKind {
    pub fn is_assign_op(self) -> bool {
        use EraTokenKind::*;
        matches!(
            self,
            Assign
                | ExprAssign
                | PlusAssign
                | MinusAssign
                | MultiplyAssign
                | DivideAssign
                | PercentAssign
                | BitAndAssign
                | BitOrAssign
                | BitXorAssign
                | BitShiftLAssign
                | BitShiftRAssign
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EraToken {
    pub kind: EraTokenKind,
    pub span: SrcSpan,
    /// Identifier name (case-normalized), string content or form content.
    pub text: ArcStr,
    pub int_value: i64,
    /// Whether the token comes from a macro. When true, `span` refers to the
    /// macro reference in the original text.
    pub is_replaced: bool,
}

impl EraToken {
    fn new(kind: EraTokenKind, span: SrcSpan) -> Self {
        EraToken {
            kind,
            span,
            text: ArcStr::new(),
            int_value: 0,
            is_replaced: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EraLexError {
    pub span: SrcSpan,
    pub msg: String,
}

/// Tokenizer for a single logical line (or an expression fragment of one).
#[derive(Debug)]
pub struct EraLexer<'a> {
    src: &'a [u8],
    pos: usize,
    /// Offset added to every produced span.
    base: u32,
    defines: Option<&'a EraDefineScope>,
    ignore_case: bool,
    pending: VecDeque<EraToken>,
    /// Names of macros currently being expanded, innermost last.
    expanding: SmallVec<[ArcStr; 4]>,
    errors: Vec<EraLexError>,
}

impl<'a> EraLexer<'a> {
    pub fn new(src: &'a str, defines: Option<&'a EraDefineScope>, ignore_case: bool) -> Self {
        EraLexer {
            src: src.as_bytes(),
            pos: 0,
            base: 0,
            defines,
            ignore_case,
            pending: VecDeque::new(),
            expanding: SmallVec::new(),
            errors: Vec::new(),
        }
    }

    /// Sets the column of `src` inside the enclosing line.
    pub fn with_base(mut self, base: u32) -> Self {
        self.base = base;
        self
    }

    pub fn errors(&self) -> &[EraLexError] {
        &self.errors
    }

    pub fn take_errors(&mut self) -> Vec<EraLexError> {
        std::mem::take(&mut self.errors)
    }

    /// Returns the unconsumed remainder of the source, or `None` while macro
    /// tokens are still pending.
    pub fn remainder(&self) -> Option<&'a str> {
        if !self.pending.is_empty() {
            return None;
        }
        std::str::from_utf8(&self.src[self.pos..]).ok()
    }

    pub fn normalize_ident(&self, name: &str) -> ArcStr {
        normalize_ident(name, self.ignore_case)
    }

    /// Tokenizes the whole input. The returned list always ends with `Eof`.
    pub fn tokenize(mut self) -> (Vec<EraToken>, Vec<EraLexError>) {
        let mut tokens = Vec::new();
        loop {
            let token = self.next_token();
            let is_eof = token.kind == EraTokenKind::Eof;
            tokens.push(token);
            if is_eof {
                break;
            }
        }
        (tokens, self.errors)
    }

    pub fn next_token(&mut self) -> EraToken {
        if let Some(token) = self.pending.pop_front() {
            return token;
        }
        let token = self.lex_raw();
        if token.kind != EraTokenKind::Identifier {
            return token;
        }
        match self.expand_macro(&token) {
            Some(mut tokens) => {
                if tokens.is_empty() {
                    // Macro expands to nothing
                    return self.next_token();
                }
                let first = tokens.remove(0);
                self.pending.extend(tokens);
                first
            }
            None => token,
        }
    }

    fn expand_macro(&mut self, token: &EraToken) -> Option<Vec<EraToken>> {
        let defines = self.defines?;
        let define = defines.get(&token.text)?;
        if self.expanding.iter().any(|x| x == &token.text) {
            self.errors.push(EraLexError {
                span: token.span,
                msg: format!("macro `{}` expands to itself", token.text),
            });
            return None;
        }
        if self.expanding.len() >= MAX_MACRO_DEPTH {
            self.errors.push(EraLexError {
                span: token.span,
                msg: format!("macro `{}` is nested too deeply", token.text),
            });
            return None;
        }
        let mut inner = EraLexer::new(&define.data, Some(defines), self.ignore_case);
        inner.expanding = self.expanding.clone();
        inner.expanding.push(token.text.clone());
        let mut tokens = Vec::new();
        loop {
            let mut t = inner.next_token();
            if t.kind == EraTokenKind::Eof {
                break;
            }
            t.span = token.span;
            t.is_replaced = true;
            tokens.push(t);
        }
        for mut e in inner.errors {
            e.span = token.span;
            if !self.errors.contains(&e) {
                self.errors.push(e);
            }
        }
        Some(tokens)
    }

    fn peek_byte(&self, offset: usize) -> Option<u8> {
        self.src.get(self.pos + offset).copied()
    }

    fn span_from(&self, start: usize) -> SrcSpan {
        SrcSpan::new(
            SrcPos(self.base + start as u32),
            (self.pos - start) as u32,
        )
    }

    fn skip_whitespace(&mut self) {
        while let Some(b) = self.peek_byte(0) {
            match b {
                b' ' | b'\t' | b'\r' | b'\n' => self.pos += 1,
                // Full-width space
                0xE3 if self.src[self.pos..].starts_with("\u{3000}".as_bytes()) => self.pos += 3,
                _ => break,
            }
        }
    }

    fn lex_raw(&mut self) -> EraToken {
        use EraTokenKind::*;

        self.skip_whitespace();
        let start = self.pos;
        let Some(b) = self.peek_byte(0) else {
            return EraToken::new(Eof, self.span_from(start));
        };
        let next = self.peek_byte(1);
        let next2 = self.peek_byte(2);
        let (kind, len) = match (b, next, next2) {
            (b'0'..=b'9', ..) => return self.lex_number(),
            (b'"', ..) => return self.lex_string(),
            (b'@', Some(b'"'), _) => return self.lex_form_string(),
            (b'<', Some(b'<'), Some(b'=')) => (BitShiftLAssign, 3),
            (b'>', Some(b'>'), Some(b'=')) => (BitShiftRAssign, 3),
            (b'+', Some(b'+'), _) => (Increment, 2),
            (b'-', Some(b'-'), _) => (Decrement, 2),
            (b'+', Some(b'='), _) => (PlusAssign, 2),
            (b'-', Some(b'='), _) => (MinusAssign, 2),
            (b'*', Some(b'='), _) => (MultiplyAssign, 2),
            (b'/', Some(b'='), _) => (DivideAssign, 2),
            (b'%', Some(b'='), _) => (PercentAssign, 2),
            (b'&', Some(b'='), _) => (BitAndAssign, 2),
            (b'|', Some(b'='), _) => (BitOrAssign, 2),
            (b'^', Some(b'='), _) => (BitXorAssign, 2),
            (b'\'', Some(b'='), _) => (ExprAssign, 2),
            (b'&', Some(b'&'), _) => (LogicalAnd, 2),
            (b'|', Some(b'|'), _) => (LogicalOr, 2),
            (b'!', Some(b'&'), _) => (LogicalNand, 2),
            (b'!', Some(b'|'), _) => (LogicalNor, 2),
            (b'!', Some(b'='), _) => (CmpNEq, 2),
            (b'=', Some(b'='), _) => (CmpEq, 2),
            (b'<', Some(b'='), _) => (CmpLEq, 2),
            (b'>', Some(b'='), _) => (CmpGEq, 2),
            (b'<', Some(b'<'), _) => (BitShiftL, 2),
            (b'>', Some(b'>'), _) => (BitShiftR, 2),
            (b'+', ..) => (Plus, 1),
            (b'-', ..) => (Minus, 1),
            (b'*', ..) => (Multiply, 1),
            (b'/', ..) => (Divide, 1),
            (b'%', ..) => (Percentage, 1),
            (b'&', ..) => (BitAnd, 1),
            (b'|', ..) => (BitOr, 1),
            (b'^', ..) => (BitXor, 1),
            (b'~', ..) => (BitNot, 1),
            (b'!', ..) => (LogicalNot, 1),
            (b'<', ..) => (CmpLT, 1),
            (b'>', ..) => (CmpGT, 1),
            (b'=', ..) => (Assign, 1),
            (b'(', ..) => (LParen, 1),
            (b')', ..) => (RParen, 1),
            (b'{', ..) => (LBrace, 1),
            (b'}', ..) => (RBrace, 1),
            (b',', ..) => (Comma, 1),
            (b':', ..) => (Colon, 1),
            (b'?', ..) => (QuestionMark, 1),
            (b'#', ..) => (NumberSign, 1),
            (b'@', ..) => (At, 1),
            (b'$', ..) => (Dollar, 1),
            _ => {
                if let Some(token) = self.lex_identifier() {
                    return token;
                }
                // Skip one whole character
                let ch_len = self.src[self.pos..]
                    .chars()
                    .next()
                    .map_or(1, |c| c.len_utf8());
                self.pos += ch_len;
                let span = self.span_from(start);
                self.errors.push(EraLexError {
                    span,
                    msg: "unexpected character".to_owned(),
                });
                return EraToken::new(Invalid, span);
            }
        };
        self.pos += len;
        EraToken::new(kind, self.span_from(start))
    }

    fn lex_identifier(&mut self) -> Option<EraToken> {
        let start = self.pos;
        let rest = std::str::from_utf8(&self.src[self.pos..]).ok()?;
        let mut chars = rest.char_indices();
        let (_, first) = chars.next()?;
        if !crate::util::is_ident_start(first) || first == '\u{3000}' {
            return None;
        }
        let end = chars
            .find(|&(_, c)| !crate::util::is_ident_char(c) || c == '\u{3000}')
            .map_or(rest.len(), |(i, _)| i);
        self.pos += end;
        let mut token = EraToken::new(EraTokenKind::Identifier, self.span_from(start));
        token.text = self.normalize_ident(&rest[..end]);
        Some(token)
    }

    fn lex_number(&mut self) -> EraToken {
        let start = self.pos;
        let rest = &self.src[self.pos..];
        let (radix, skip) = match rest {
            [b'0', b'x' | b'X', ..] => (16, 2),
            [b'0', b'b' | b'B', ..] => (2, 2),
            _ => (10, 0),
        };
        self.pos += skip;
        let digits_start = self.pos;
        while let Some(b) = self.peek_byte(0) {
            if (b as char).is_digit(radix) {
                self.pos += 1;
            } else {
                break;
            }
        }
        // Trailing identifier characters make the literal invalid (`12ab`)
        let mut bad_suffix = false;
        while let Some(b) = self.peek_byte(0) {
            if b.is_ascii_alphanumeric() || b == b'_' {
                bad_suffix = true;
                self.pos += 1;
            } else {
                break;
            }
        }
        let span = self.span_from(start);
        let digits = std::str::from_utf8(&self.src[digits_start..self.pos]).unwrap_or("");
        match (bad_suffix, i64::from_str_radix(digits, radix)) {
            (false, Ok(value)) => {
                let mut token = EraToken::new(EraTokenKind::IntLiteral, span);
                token.int_value = value;
                token
            }
            _ => {
                self.errors.push(EraLexError {
                    span,
                    msg: "invalid integer literal".to_owned(),
                });
                EraToken::new(EraTokenKind::Invalid, span)
            }
        }
    }

    fn lex_string(&mut self) -> EraToken {
        let start = self.pos;
        self.pos += 1;
        let mut content = Vec::new();
        loop {
            match self.peek_byte(0) {
                None => {
                    let span = self.span_from(start);
                    self.errors.push(EraLexError {
                        span,
                        msg: "unterminated string literal".to_owned(),
                    });
                    return EraToken::new(EraTokenKind::Invalid, span);
                }
                Some(b'"') => {
                    self.pos += 1;
                    break;
                }
                Some(b'\\') => {
                    match self.peek_byte(1) {
                        Some(b'n') => content.push(b'\n'),
                        Some(b't') => content.push(b'\t'),
                        Some(c) => content.push(c),
                        None => (),
                    }
                    self.pos += 2;
                }
                Some(c) => {
                    content.push(c);
                    self.pos += 1;
                }
            }
        }
        let mut token = EraToken::new(EraTokenKind::StringLiteral, self.span_from(start));
        token.text = ArcStr::from(content.to_str_lossy().as_ref());
        token
    }

    /// Lexes `@"..."`, keeping the content raw for the form parser. Braces and
    /// percent pairs may contain nested quotes.
    fn lex_form_string(&mut self) -> EraToken {
        let start = self.pos;
        self.pos += 2;
        let content_start = self.pos;
        let mut depth = 0usize;
        let mut in_inner_str = false;
        loop {
            match self.peek_byte(0) {
                None => {
                    let span = self.span_from(start);
                    self.errors.push(EraLexError {
                        span,
                        msg: "unterminated form string".to_owned(),
                    });
                    return EraToken::new(EraTokenKind::Invalid, span);
                }
                Some(b'\\') => self.pos += 2,
                Some(b'"') if depth == 0 => break,
                Some(b'"') => {
                    in_inner_str = !in_inner_str;
                    self.pos += 1;
                }
                Some(b'{') if !in_inner_str => {
                    depth += 1;
                    self.pos += 1;
                }
                Some(b'}') if !in_inner_str => {
                    depth = depth.saturating_sub(1);
                    self.pos += 1;
                }
                Some(_) => self.pos += 1,
            }
        }
        let content_end = self.pos.min(self.src.len());
        self.pos += 1;
        let mut token = EraToken::new(EraTokenKind::FormStringLiteral, self.span_from(start));
        token.text = ArcStr::from(self.src[content_start..content_end].to_str_lossy().as_ref());
        token
    }
}

pub fn normalize_ident(name: &str, ignore_case: bool) -> ArcStr {
    if ignore_case && name.bytes().any(|b| b.is_ascii_lowercase()) {
        ArcStr::from(name.to_ascii_uppercase())
    } else {
        ArcStr::from(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(src: &str, defines: Option<&EraDefineScope>) -> Vec<EraTokenKind> {
        let (tokens, _) = EraLexer::new(src, defines, true).tokenize();
        tokens.into_iter().map(|x| x.kind).collect()
    }

    fn define(scope: &mut EraDefineScope, name: &str, body: &str) {
        scope.insert(
            ArcStr::from(name),
            EraDefineData {
                filename: arcstr::literal!("TEST.ERH"),
                loc: SrcLoc::default(),
                data: ArcStr::from(body),
            },
        );
    }

    #[test]
    fn operators_and_literals() {
        use EraTokenKind::*;
        assert_eq!(
            kinds("a:1 <<= 0x1F + \"s\\\"q\" != b", None),
            vec![
                Identifier,
                Colon,
                IntLiteral,
                BitShiftLAssign,
                IntLiteral,
                Plus,
                StringLiteral,
                CmpNEq,
                Identifier,
                Eof
            ]
        );
        let (tokens, errors) = EraLexer::new("0x1F \"s\\\"q\" name", None, true).tokenize();
        assert!(errors.is_empty());
        assert_eq!(tokens[0].int_value, 31);
        assert_eq!(tokens[1].text.as_str(), "s\"q");
        assert_eq!(tokens[2].text.as_str(), "NAME");
    }

    #[test]
    fn case_normalization_is_optional() {
        let (tokens, _) = EraLexer::new("Name", None, false).tokenize();
        assert_eq!(tokens[0].text.as_str(), "Name");
    }

    #[test]
    fn form_string_keeps_nested_quotes() {
        let (tokens, errors) =
            EraLexer::new(r#"@"Hi {name + "!"} there""#, None, true).tokenize();
        assert!(errors.is_empty());
        assert_eq!(tokens[0].kind, EraTokenKind::FormStringLiteral);
        assert_eq!(tokens[0].text.as_str(), r#"Hi {name + "!"} there"#);
    }

    #[test]
    fn recursive_macro_expansion() {
        let mut scope = EraDefineScope::new();
        define(&mut scope, "TWO", "ONE + ONE");
        define(&mut scope, "ONE", "1");
        let (tokens, errors) = EraLexer::new("TWO * 3", Some(&scope), true).tokenize();
        assert!(errors.is_empty());
        let kinds: Vec<_> = tokens.iter().map(|x| x.kind).collect();
        use EraTokenKind::*;
        assert_eq!(
            kinds,
            vec![IntLiteral, Plus, IntLiteral, Multiply, IntLiteral, Eof]
        );
        assert!(tokens[0].is_replaced);
        assert_eq!(tokens[0].span, tokens[2].span);
    }

    #[test]
    fn self_referential_macro_is_reported_once() {
        let mut scope = EraDefineScope::new();
        define(&mut scope, "LOOPY", "LOOPY + 1");
        let (tokens, errors) = EraLexer::new("LOOPY", Some(&scope), true).tokenize();
        assert_eq!(errors.len(), 1);
        assert_eq!(tokens[0].kind, EraTokenKind::Identifier);
        assert_eq!(tokens[0].text.as_str(), "LOOPY");
    }

    #[test]
    fn bad_number_is_invalid() {
        let (tokens, errors) = EraLexer::new("12ab", None, true).tokenize();
        assert_eq!(tokens[0].kind, EraTokenKind::Invalid);
        assert_eq!(errors.len(), 1);
    }
}
