use arcstr::ArcStr;
use log::debug;

use crate::{
    commands::EraCmd,
    expr::{EraExprCtx, EraExprParser},
    interpret::{is_builtin_method, EraInterpretError, EraInterpreter},
    lexer::{normalize_ident, EraLexer, EraTokenKind},
    preprocess::{EraPpLine, EraPreprocessor},
    types::*,
    util::{bmatch_caseless, check_ident, strip_comment, offset_within},
    vars::{is_builtin_var, EraVarDecl, EraVarDims, EraVarFlags, EraVarPool},
};

/// Warning level of macro redefinitions and reserved macro names.
const MACRO_COLLISION_WARN_LEVEL: u8 = 2;

/// A `#DIM`/`#DIMS` line that has been syntax-checked but not evaluated.
#[derive(Debug, Clone)]
pub struct EraDimDecl {
    pub filename: ArcStr,
    pub loc: SrcLoc,
    pub is_string: bool,
    pub flags: EraVarFlags,
    pub name: ArcStr,
    pub name_span: SrcSpan,
    /// Everything after the name: `, dims... = inits...`.
    pub rest: ArcStr,
    pub rest_base: u32,
}

impl EraDimDecl {
    pub fn is_const(&self) -> bool {
        self.flags.contains(EraVarFlags::CONST)
    }
}

fn dim_keyword(word: &str) -> Option<EraVarFlags> {
    bmatch_caseless!(word.as_bytes();
        b"CONST" => Some(EraVarFlags::CONST),
        b"SAVEDATA" => Some(EraVarFlags::SAVEDATA),
        b"GLOBAL" => Some(EraVarFlags::GLOBAL),
        b"CHARADATA" => Some(EraVarFlags::CHARADATA),
        b"DYNAMIC" => Some(EraVarFlags::DYNAMIC),
        b"REF" => Some(EraVarFlags::REF),
        b"STATIC" => Some(EraVarFlags::STATIC),
        _ => None,
    )
}

/// Parses the text after `#DIM`/`#DIMS` up to the variable name. The rest of
/// the line is kept raw so that it can be re-tokenized once more macros are
/// known.
pub fn parse_dim_decl(
    text: &str,
    base: u32,
    ignore_case: bool,
) -> Result<(EraVarFlags, ArcStr, SrcSpan, ArcStr, u32), (SrcSpan, String)> {
    let mut lexer = EraLexer::new(text, None, ignore_case).with_base(base);
    let mut flags = EraVarFlags::empty();
    let (name, name_span) = loop {
        let token = lexer.next_token();
        if token.kind != EraTokenKind::Identifier {
            return Err((token.span, "expected a variable name".to_owned()));
        }
        match dim_keyword(&token.text) {
            Some(flag) => {
                if flags.contains(flag) {
                    return Err((token.span, format!("duplicate keyword `{}`", token.text)));
                }
                flags |= flag;
            }
            None => break (token.text.clone(), token.span),
        }
    };
    if let Err(e) = check_ident(&name) {
        return Err((name_span, e));
    }
    if flags.contains(EraVarFlags::CONST)
        && flags.intersects(EraVarFlags::DYNAMIC | EraVarFlags::REF)
    {
        return Err((name_span, "CONST cannot be combined with DYNAMIC or REF".to_owned()));
    }
    let rest = lexer.remainder().unwrap_or_default();
    if let Some(e) = lexer.take_errors().into_iter().next() {
        return Err((e.span, e.msg));
    }
    let rest_base = base + offset_within(text, rest).unwrap_or(text.len()) as u32;
    if flags.contains(EraVarFlags::REF) && rest.contains('=') {
        return Err((name_span, "REF variables cannot have initial values".to_owned()));
    }
    Ok((flags, name, name_span, ArcStr::from(rest), rest_base))
}

/// Evaluates a queued declaration. `VarNotFound` means the declaration may
/// resolve once more constants are known.
pub fn resolve_dim(
    decl: &EraDimDecl,
    ctx: EraExprCtx,
    lookup: &dyn Fn(&str, &[i64]) -> Option<ScalarValue>,
) -> Result<EraVarDecl, EraInterpretError> {
    let to_err = |e: crate::expr::EraParseError| EraInterpretError::Others(e.span, e.msg);
    let tokens = ctx.tokenize(&decl.rest, decl.rest_base).map_err(to_err)?;
    let mut parser = EraExprParser::new(&tokens, ctx);
    let mut dim_exprs = Vec::new();
    while parser.try_eat(EraTokenKind::Comma).is_some() {
        dim_exprs.push(parser.expression().map_err(to_err)?);
    }
    let mut init_exprs = Vec::new();
    if parser.try_eat(EraTokenKind::Assign).is_some() {
        init_exprs = parser.expr_list(EraTokenKind::Eof).map_err(to_err)?;
    }
    parser.expect_end().map_err(to_err)?;

    let interp = EraInterpreter::new(lookup);
    let mut dims = EraVarDims::new();
    for expr in &dim_exprs {
        let size = interp.interpret_int(expr, expr.span())?;
        if size <= 0 || size > u32::MAX as i64 {
            return Err(EraInterpretError::Others(
                expr.span(),
                format!("invalid dimension size {size}"),
            ));
        }
        dims.push(size as u32);
    }
    if dims.is_empty() {
        dims.push(1);
    }
    if dims.len() > 3 {
        return Err(EraInterpretError::Others(
            decl.name_span,
            "variables have at most 3 dimensions".to_owned(),
        ));
    }
    let kind = if decl.is_string {
        ScalarValueKind::Str
    } else {
        ScalarValueKind::Int
    };
    let mut init = Vec::with_capacity(init_exprs.len());
    for expr in &init_exprs {
        let Some(expr) = expr else {
            init.push(ScalarValue::default_of(kind));
            continue;
        };
        let value = interp.interpret_expression(expr)?;
        if value.kind() != kind {
            return Err(EraInterpretError::Others(
                expr.span(),
                format!("expected {kind} initial value, found {}", value.kind()),
            ));
        }
        init.push(value);
    }
    Ok(EraVarDecl {
        name: decl.name.clone(),
        kind,
        dims,
        flags: decl.flags,
        init,
        filename: decl.filename.clone(),
        loc: decl.loc,
    })
}

/// Returns whether `name` is a command or builtin method name. Builtin
/// variables are not reserved: header declarations may replace them.
pub fn is_reserved_name(name: &str) -> bool {
    EraCmd::from_name(name).is_some() || is_builtin_method(name)
}

fn quote_str(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for c in value.chars() {
        if matches!(c, '"' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}

/// Loads declaration files. All files must be loaded before `finish`, and
/// `finish` must run before any script file is parsed.
#[derive(Debug)]
pub struct EraHeaderLoader {
    is_debug: bool,
    ignore_case: bool,
    defines: EraDefineScope,
    pending: Vec<EraDimDecl>,
}

impl EraHeaderLoader {
    pub fn new(is_debug: bool, ignore_case: bool) -> Self {
        EraHeaderLoader {
            is_debug,
            ignore_case,
            defines: EraDefineScope::new(),
            pending: Vec::new(),
        }
    }

    pub fn defines(&self) -> &EraDefineScope {
        &self.defines
    }

    pub fn into_defines(self) -> EraDefineScope {
        self.defines
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn load_file(&mut self, filename: ArcStr, src: &str, diag: &mut Diagnostic) {
        let mut pp = EraPreprocessor::new(self.is_debug, self.ignore_case);
        for (i, raw_line) in src.lines().enumerate() {
            let content = strip_comment(raw_line);
            let line = content.trim();
            if line.is_empty() {
                continue;
            }
            let col = (content.len() - content.trim_start().len()) as u32;
            let loc = SrcLoc::new(i as u32 + 1, col);
            if pp.process_line(line, loc, &self.defines, diag) != EraPpLine::Active {
                continue;
            }
            diag.set_category(EraDiagCategory::Header);
            let Some(body) = line.strip_prefix('#') else {
                diag.span_warn(ArcStr::new(), loc, "only `#` declarations are allowed here; line ignored");
                continue;
            };
            let keyword_len = body
                .find(|c: char| !crate::util::is_ident_char(c))
                .unwrap_or(body.len());
            let (keyword, args) = body.split_at(keyword_len);
            let args_base = 1 + keyword_len as u32 + (args.len() - args.trim_start().len()) as u32;
            let args = args.trim_start();
            enum Kind {
                Define,
                Dim(bool),
                Function,
                Unknown,
            }
            let kind = bmatch_caseless!(keyword.as_bytes();
                b"DEFINE" => Kind::Define,
                b"DIM" => Kind::Dim(false),
                b"DIMS" => Kind::Dim(true),
                b"FUNCTION" => Kind::Function,
                b"FUNCTIONS" => Kind::Function,
                _ => Kind::Unknown,
            );
            match kind {
                Kind::Define => self.load_define(&filename, args, args_base, loc, diag),
                Kind::Dim(is_string) => {
                    match parse_dim_decl(args, args_base, self.ignore_case) {
                        Ok((flags, name, name_span, rest, rest_base)) => {
                            if flags.intersects(EraVarFlags::DYNAMIC | EraVarFlags::REF) {
                                diag.span_err(
                                    ArcStr::new(),
                                    loc.with_span(name_span),
                                    "DYNAMIC and REF are only allowed inside functions",
                                );
                                continue;
                            }
                            self.pending.push(EraDimDecl {
                                filename: filename.clone(),
                                loc,
                                is_string,
                                flags,
                                name,
                                name_span,
                                rest,
                                rest_base,
                            });
                        }
                        Err((span, msg)) => {
                            diag.span_err(ArcStr::new(), loc.with_span(span), msg);
                        }
                    }
                }
                Kind::Function => {
                    diag.span_note(
                        ArcStr::new(),
                        loc,
                        format!("#{keyword} is only meaningful below a function label; ignored"),
                    );
                }
                Kind::Unknown => {
                    diag.span_warn(
                        ArcStr::new(),
                        loc,
                        format!("unknown declaration `#{keyword}`; line ignored"),
                    );
                }
            }
        }
        pp.finish(diag);
        debug!(
            "loaded header `{filename}`: {} macro(s), {} pending declaration(s)",
            self.defines.len(),
            self.pending.len()
        );
    }

    fn load_define(
        &mut self,
        filename: &ArcStr,
        args: &str,
        base: u32,
        loc: SrcLoc,
        diag: &mut Diagnostic,
    ) {
        diag.set_category(EraDiagCategory::Macro);
        let name_len = args
            .find(|c: char| !crate::util::is_ident_char(c))
            .unwrap_or(args.len());
        let (name, body) = args.split_at(name_len);
        let name_span = SrcSpan::new(SrcPos(base), name_len as u32);
        if body.starts_with('(') {
            diag.span_err(
                ArcStr::new(),
                loc.with_span(name_span),
                format!("function-style macro `{name}` is not supported"),
            );
            return;
        }
        if let Err(e) = check_ident(name) {
            diag.span_err(ArcStr::new(), loc.with_span(name_span), e);
            return;
        }
        let key = normalize_ident(name, self.ignore_case);
        if is_reserved_name(&key) || is_builtin_var(&key) {
            diag.span_warn_level(
                ArcStr::new(),
                loc.with_span(name_span),
                MACRO_COLLISION_WARN_LEVEL,
                format!("macro `{name}` shadows a builtin name"),
            );
        }
        if let Some(prev) = self.defines.get(&key) {
            diag.span_warn_level(
                ArcStr::new(),
                loc.with_span(name_span),
                MACRO_COLLISION_WARN_LEVEL,
                format!(
                    "macro `{name}` is already defined at {}:{}; later definition ignored",
                    prev.filename, prev.loc
                ),
            );
            return;
        }
        self.defines.insert(
            key,
            EraDefineData {
                filename: filename.clone(),
                loc,
                data: ArcStr::from(body.trim()),
            },
        );
    }

    /// Resolves queued declarations: constants first, then the rest, each to
    /// a fixpoint. Returns whether every declaration resolved. Resolved ones
    /// stay registered either way.
    pub fn finish(&mut self, vars: &mut EraVarPool, diag: &mut Diagnostic) -> bool {
        let (consts, others): (Vec<_>, Vec<_>) =
            std::mem::take(&mut self.pending).into_iter().partition(|x| x.is_const());
        let mut all_resolved = true;
        for mut queue in [consts, others] {
            let mut sweep = 0;
            while !queue.is_empty() {
                sweep += 1;
                let before = queue.len();
                queue.retain(|decl| !self.try_resolve(decl, vars, diag));
                debug!(
                    "header sweep {sweep}: resolved {} declaration(s), {} left",
                    before - queue.len(),
                    queue.len()
                );
                if queue.len() == before {
                    break;
                }
            }
            for decl in &queue {
                all_resolved = false;
                let msg = {
                    let ctx = EraExprCtx::new(Some(&self.defines), self.ignore_case);
                    let lookup = |name: &str, idx: &[i64]| vars.get_const(name, idx);
                    match resolve_dim(decl, ctx, &lookup) {
                        Err(e) => e.message(),
                        Ok(_) => "declaration could not be resolved".to_owned(),
                    }
                };
                diag.set_category(EraDiagCategory::Header).span_err(
                    decl.filename.clone(),
                    decl.loc,
                    format!("unresolved declaration of `{}`: {msg}", decl.name),
                );
            }
        }
        all_resolved
    }

    /// Returns `true` when `decl` leaves the queue, resolved or failed.
    fn try_resolve(&mut self, decl: &EraDimDecl, vars: &mut EraVarPool, diag: &mut Diagnostic) -> bool {
        let result = {
            let ctx = EraExprCtx::new(Some(&self.defines), self.ignore_case);
            let lookup = |name: &str, idx: &[i64]| vars.get_const(name, idx);
            resolve_dim(decl, ctx, &lookup)
        };
        let resolved = match result {
            Ok(x) => x,
            Err(EraInterpretError::VarNotFound(..)) => return false,
            Err(EraInterpretError::Others(span, msg)) => {
                diag.set_category(EraDiagCategory::Header).span_err(
                    decl.filename.clone(),
                    decl.loc.with_span(span),
                    msg,
                );
                return true;
            }
        };
        diag.set_category(EraDiagCategory::Header);
        if self.defines.contains(&resolved.name)
            || vars.global_decl(&resolved.name).is_some()
            || is_reserved_name(&resolved.name)
        {
            diag.span_err(
                decl.filename.clone(),
                decl.loc.with_span(decl.name_span),
                format!("`{}` is already defined", resolved.name),
            );
            return true;
        }
        let is_scalar = resolved.dims.as_slice() == [1];
        if resolved.is_const() && is_scalar {
            let value = resolved
                .init
                .first()
                .cloned()
                .unwrap_or_else(|| ScalarValue::default_of(resolved.kind));
            if resolved.init.len() > 1 {
                diag.span_err(
                    decl.filename.clone(),
                    decl.loc.with_span(decl.name_span),
                    format!("`{}` has more initial values than elements", resolved.name),
                );
                return true;
            }
            let data = match &value {
                ScalarValue::Int(x) if *x < 0 => format!("({x})"),
                ScalarValue::Str(x) => quote_str(x),
                other => other.to_string(),
            };
            self.defines.insert(
                resolved.name.clone(),
                EraDefineData {
                    filename: decl.filename.clone(),
                    loc: decl.loc,
                    data: ArcStr::from(data),
                },
            );
        }
        // Constants stay readable as globals too.
        if let Err(e) = vars.add_global(resolved) {
            diag.span_err(decl.filename.clone(), decl.loc.with_span(decl.name_span), e);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use indoc::indoc;

    use super::*;

    fn load(files: &[&str]) -> (EraHeaderLoader, EraVarPool, Diagnostic, bool) {
        let mut loader = EraHeaderLoader::new(false, true);
        let mut diag = Diagnostic::with_file(arcstr::literal!("TEST.ERH"));
        for src in files {
            loader.load_file(arcstr::literal!("TEST.ERH"), src, &mut diag);
        }
        let mut vars = EraVarPool::new();
        let ok = loader.finish(&mut vars, &mut diag);
        (loader, vars, diag, ok)
    }

    fn macro_value(loader: &EraHeaderLoader, name: &str) -> Option<String> {
        loader.defines().get(name).map(|x| x.data.to_string())
    }

    #[test]
    fn const_fixpoint_in_either_order() {
        for src in [
            "#DIM CONST A = B+1\n#DIM CONST B = 2\n",
            "#DIM CONST B = 2\n#DIM CONST A = B+1\n",
        ] {
            let (loader, _, diag, ok) = load(&[src]);
            assert!(ok, "{:?}", diag.entries());
            assert!(diag.is_empty());
            assert_eq!(macro_value(&loader, "A").as_deref(), Some("3"));
            assert_eq!(macro_value(&loader, "B").as_deref(), Some("2"));
        }
    }

    #[test]
    fn non_const_sizes_use_consts() -> anyhow::Result<()> {
        let src = indoc! {"
            #DIM ITEMS, SIZE * 2
            #DIMS CONST NAMES, 2 = \"Ann\", \"Bob\"
            #DIM CONST SIZE = 5
            #DIM SAVEDATA GRID, SIZE, 3
        "};
        let (_, vars, diag, ok) = load(&[src]);
        assert!(ok, "{:?}", diag.entries());
        let items = vars.get_global("ITEMS").expect("ITEMS declared");
        assert_eq!(items.borrow().dims(), &[10]);
        let grid = vars.get_global("GRID").expect("GRID declared");
        assert_eq!(grid.borrow().dims(), &[5, 3]);
        assert_eq!(
            vars.get_const("NAMES", &[1]),
            Some(ScalarValue::Str("Bob".to_owned()))
        );
        Ok(())
    }

    #[test]
    fn unresolved_items_keep_partial_results() {
        let src = indoc! {"
            #DIM CONST A = MISSING + 1
            #DIM CONST B = A
            #DIM CONST C = 7
        "};
        let (loader, _, diag, ok) = load(&[src]);
        assert!(!ok);
        assert_eq!(macro_value(&loader, "C").as_deref(), Some("7"));
        let errors: Vec<_> = diag
            .entries()
            .iter()
            .filter(|x| x.level == DiagnosticLevel::Error)
            .collect();
        assert_eq!(errors.len(), 2);
        assert!(errors[0].message.contains("`A`"));
    }

    #[test]
    fn defines_and_their_collisions() {
        let src = indoc! {"
            #DEFINE MAXHP 100
            #DEFINE MAXHP 200
            #DEFINE TWICE(X) X*2
            #DEFINE PRINT 1
            [IF MAXHP]
            #DEFINE SEEN 1
            [ENDIF]
            #FUNCTION
        "};
        let (loader, _, diag, ok) = load(&[src]);
        assert!(ok);
        assert_eq!(macro_value(&loader, "MAXHP").as_deref(), Some("100"));
        assert!(loader.defines().contains("SEEN"));
        assert!(!loader.defines().contains("TWICE"));
        let levels: Vec<_> = diag.entries().iter().map(|x| x.level).collect();
        assert_eq!(
            levels,
            vec![
                DiagnosticLevel::Warning,
                DiagnosticLevel::Error,
                DiagnosticLevel::Warning,
                DiagnosticLevel::Note,
            ]
        );
        assert!(diag.entries()[0].warn_level >= MACRO_COLLISION_WARN_LEVEL);
    }

    #[test]
    fn negative_const_is_parenthesized() {
        let (loader, _, _, ok) = load(&["#DIM CONST NEG = -4\n#DIM CONST POS = 0 - NEG * 2\n"]);
        assert!(ok);
        assert_eq!(macro_value(&loader, "NEG").as_deref(), Some("(-4)"));
        assert_eq!(macro_value(&loader, "POS").as_deref(), Some("8"));
    }
}
