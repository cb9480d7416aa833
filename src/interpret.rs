use arcstr::ArcStr;

use crate::{
    expr::{EraBinaryOp, EraExpr, EraFormPart, EraFormString, EraUnaryOp},
    types::*,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EraInterpretError {
    VarNotFound(ArcStr, SrcSpan),
    Others(SrcSpan, String),
}

impl EraInterpretError {
    pub fn span(&self) -> SrcSpan {
        match self {
            EraInterpretError::VarNotFound(_, span) | EraInterpretError::Others(span, _) => *span,
        }
    }

    pub fn message(&self) -> String {
        match self {
            EraInterpretError::VarNotFound(name, _) => format!("undefined identifier `{name}`"),
            EraInterpretError::Others(_, msg) => msg.clone(),
        }
    }
}

/// Evaluates constant expressions at load time. Variables resolve through
/// `lookup`, which sees only constants.
pub struct EraInterpreter<'a> {
    lookup: &'a dyn Fn(&str, &[i64]) -> Option<ScalarValue>,
}

impl<'a> EraInterpreter<'a> {
    pub fn new(lookup: &'a dyn Fn(&str, &[i64]) -> Option<ScalarValue>) -> Self {
        Self { lookup }
    }

    pub fn interpret_expression(&self, expr: &EraExpr) -> Result<ScalarValue, EraInterpretError> {
        Ok(match expr {
            EraExpr::Int(x, _) => ScalarValue::Int(*x),
            EraExpr::Str(x, _) => ScalarValue::Str(x.to_string()),
            EraExpr::Form(form, _) => ScalarValue::Str(self.interpret_form(form)?),
            EraExpr::Var(var) => {
                let mut indices = Vec::with_capacity(var.indices.len());
                for index in &var.indices {
                    let span = index.span();
                    indices.push(self.interpret_int(index, span)?);
                }
                (self.lookup)(&var.name, &indices)
                    .ok_or_else(|| EraInterpretError::VarNotFound(var.name.clone(), var.span))?
            }
            EraExpr::Call { name, args, span } => {
                let mut values = Vec::with_capacity(args.len());
                for arg in args {
                    values.push(match arg {
                        Some(arg) => self.interpret_expression(arg)?,
                        None => ScalarValue::Empty,
                    });
                }
                match call_builtin(name, &values, None) {
                    Some(Ok(value)) => value,
                    Some(Err(e)) => return Err(EraInterpretError::Others(*span, e)),
                    None => {
                        return Err(EraInterpretError::Others(
                            *span,
                            format!("`{name}` cannot be evaluated as a constant"),
                        ))
                    }
                }
            }
            EraExpr::Unary { op, operand, span } => {
                let value = self.interpret_expression(operand)?;
                apply_unary(*op, value).map_err(|e| EraInterpretError::Others(*span, e))?
            }
            EraExpr::Binary { op, lhs, rhs, span } => {
                let lhs = self.interpret_expression(lhs)?;
                // Short-circuit logical operators
                match (op, lhs.as_int()) {
                    (EraBinaryOp::And, Some(0)) => return Ok(ScalarValue::Int(0)),
                    (EraBinaryOp::Or, Some(x)) if x != 0 => return Ok(ScalarValue::Int(1)),
                    _ => (),
                }
                let rhs = self.interpret_expression(rhs)?;
                apply_binary(*op, lhs, rhs).map_err(|e| EraInterpretError::Others(*span, e))?
            }
            EraExpr::Ternary {
                cond,
                then,
                otherwise,
                ..
            } => {
                if self.interpret_expression(cond)?.is_truthy() {
                    self.interpret_expression(then)?
                } else {
                    self.interpret_expression(otherwise)?
                }
            }
        })
    }

    pub fn interpret_int(&self, expr: &EraExpr, span: SrcSpan) -> Result<i64, EraInterpretError> {
        match self.interpret_expression(expr)? {
            ScalarValue::Int(x) => Ok(x),
            other => Err(EraInterpretError::Others(
                span,
                format!("expected integer, found {}", other.kind()),
            )),
        }
    }

    pub fn interpret_form(&self, form: &EraFormString) -> Result<String, EraInterpretError> {
        let mut out = String::new();
        for part in &form.parts {
            match part {
                EraFormPart::Text(x) => out.push_str(x),
                EraFormPart::Expr {
                    expr,
                    width,
                    align_left,
                } => {
                    let value = self.interpret_expression(expr)?.to_string();
                    let width = match width {
                        Some(w) => Some(self.interpret_int(w, w.span())?),
                        None => None,
                    };
                    out.push_str(&pad_text(value, width, *align_left));
                }
                EraFormPart::Ternary {
                    cond,
                    then,
                    otherwise,
                } => {
                    let branch = if self.interpret_expression(cond)?.is_truthy() {
                        then
                    } else {
                        otherwise
                    };
                    out.push_str(&self.interpret_form(branch)?);
                }
            }
        }
        Ok(out)
    }
}

pub fn apply_unary(op: EraUnaryOp, value: ScalarValue) -> Result<ScalarValue, String> {
    let Some(x) = value.coerce_as_int() else {
        return Err(format!("operator {op} expects an integer operand"));
    };
    Ok(ScalarValue::Int(match op {
        EraUnaryOp::Neg => x.wrapping_neg(),
        EraUnaryOp::Pos => x,
        EraUnaryOp::Not => (x == 0) as i64,
        EraUnaryOp::BitNot => !x,
    }))
}

pub fn apply_binary(
    op: EraBinaryOp,
    lhs: ScalarValue,
    rhs: ScalarValue,
) -> Result<ScalarValue, String> {
    use EraBinaryOp::*;

    let lhs = if lhs.is_str() || rhs.is_str() {
        lhs
    } else {
        ScalarValue::Int(lhs.coerce_as_int().unwrap_or(0))
    };
    Ok(match (lhs, rhs) {
        (ScalarValue::Int(l), rhs) => {
            let Some(r) = rhs.coerce_as_int() else {
                return Err(format!("operator {op} cannot mix integer and string"));
            };
            ScalarValue::Int(match op {
                Add => l.wrapping_add(r),
                Sub => l.wrapping_sub(r),
                Mul => l.wrapping_mul(r),
                Div | Rem if r == 0 => return Err("division by zero".to_owned()),
                Div => l.wrapping_div(r),
                Rem => l.wrapping_rem(r),
                BitAnd => l & r,
                BitOr => l | r,
                BitXor => l ^ r,
                Shl => l.wrapping_shl(r as u32),
                Shr => l.wrapping_shr(r as u32),
                And => (l != 0 && r != 0) as i64,
                Or => (l != 0 || r != 0) as i64,
                Nand => !(l != 0 && r != 0) as i64,
                Nor => !(l != 0 || r != 0) as i64,
                Eq => (l == r) as i64,
                NEq => (l != r) as i64,
                Lt => (l < r) as i64,
                Gt => (l > r) as i64,
                LEq => (l <= r) as i64,
                GEq => (l >= r) as i64,
            })
        }
        (ScalarValue::Str(l), ScalarValue::Int(r)) if op == Mul => {
            ScalarValue::Str(l.repeat(r.clamp(0, 1 << 16) as usize))
        }
        (ScalarValue::Str(l), rhs) => {
            let Some(r) = rhs.coerce_as_str() else {
                return Err(format!("operator {op} cannot mix string and integer"));
            };
            match op {
                Add => ScalarValue::Str(l + r),
                Eq => ScalarValue::Int((l == r) as i64),
                NEq => ScalarValue::Int((l != r) as i64),
                Lt => ScalarValue::Int((l.as_str() < r) as i64),
                Gt => ScalarValue::Int((l.as_str() > r) as i64),
                LEq => ScalarValue::Int((l.as_str() <= r) as i64),
                GEq => ScalarValue::Int((l.as_str() >= r) as i64),
                _ => return Err(format!("operator {op} is not defined for strings")),
            }
        }
        (other, _) => return Err(format!("operator {op} got a {} operand", other.kind())),
    })
}

/// Pads `text` to `width` characters; positive widths only.
pub fn pad_text(text: String, width: Option<i64>, align_left: bool) -> String {
    let Some(width) = width.filter(|&w| w > 0) else {
        return text;
    };
    let len = text.chars().count();
    let width = width as usize;
    if len >= width {
        return text;
    }
    let pad = " ".repeat(width - len);
    if align_left {
        text + &pad
    } else {
        pad + &text
    }
}

/// Builtin expression methods. Returns `None` when `name` is not a builtin.
/// `rand` is absent during constant evaluation, which makes `RAND` unavailable.
pub fn call_builtin(
    name: &str,
    args: &[ScalarValue],
    rand: Option<&mut dyn FnMut() -> u64>,
) -> Option<Result<ScalarValue, String>> {
    use crate::util::bmatch_caseless;

    #[derive(Clone, Copy)]
    enum Builtin {
        Abs,
        Sign,
        Max,
        Min,
        Limit,
        InRange,
        Power,
        Rand,
        StrLenS,
        ToStr,
        ToInt,
        IsNumeric,
        Unicode,
    }

    let builtin = bmatch_caseless!(name.as_bytes();
        b"ABS" => Some(Builtin::Abs),
        b"SIGN" => Some(Builtin::Sign),
        b"MAX" => Some(Builtin::Max),
        b"MIN" => Some(Builtin::Min),
        b"LIMIT" => Some(Builtin::Limit),
        b"INRANGE" => Some(Builtin::InRange),
        b"POWER" => Some(Builtin::Power),
        b"RAND" => Some(Builtin::Rand),
        b"STRLENS" => Some(Builtin::StrLenS),
        b"TOSTR" => Some(Builtin::ToStr),
        b"TOINT" => Some(Builtin::ToInt),
        b"ISNUMERIC" => Some(Builtin::IsNumeric),
        b"UNICODE" => Some(Builtin::Unicode),
        _ => None,
    )?;

    let int_arg = |i: usize| -> Result<i64, String> {
        args.get(i)
            .and_then(|x| x.coerce_as_int())
            .ok_or_else(|| format!("{name}: argument {} must be an integer", i + 1))
    };
    let str_arg = |i: usize| -> Result<&str, String> {
        args.get(i)
            .and_then(|x| x.coerce_as_str())
            .ok_or_else(|| format!("{name}: argument {} must be a string", i + 1))
    };
    let arity = |min: usize, max: usize| -> Result<(), String> {
        if (min..=max).contains(&args.len()) {
            Ok(())
        } else {
            Err(format!("{name}: expected {min} to {max} arguments, got {}", args.len()))
        }
    };

    let result = (|| -> Result<ScalarValue, String> {
        Ok(match builtin {
            Builtin::Abs => {
                arity(1, 1)?;
                ScalarValue::Int(int_arg(0)?.wrapping_abs())
            }
            Builtin::Sign => {
                arity(1, 1)?;
                ScalarValue::Int(int_arg(0)?.signum())
            }
            Builtin::Max | Builtin::Min => {
                arity(1, usize::MAX)?;
                let mut acc = int_arg(0)?;
                for i in 1..args.len() {
                    let x = int_arg(i)?;
                    acc = if matches!(builtin, Builtin::Max) {
                        acc.max(x)
                    } else {
                        acc.min(x)
                    };
                }
                ScalarValue::Int(acc)
            }
            Builtin::Limit => {
                arity(3, 3)?;
                let (x, lo, hi) = (int_arg(0)?, int_arg(1)?, int_arg(2)?);
                ScalarValue::Int(x.max(lo).min(hi))
            }
            Builtin::InRange => {
                arity(3, 3)?;
                let (x, lo, hi) = (int_arg(0)?, int_arg(1)?, int_arg(2)?);
                ScalarValue::Int((lo <= x && x <= hi) as i64)
            }
            Builtin::Power => {
                arity(2, 2)?;
                let (x, y) = (int_arg(0)?, int_arg(1)?);
                let y = u32::try_from(y).map_err(|_| "POWER: negative exponent".to_owned())?;
                ScalarValue::Int(x.wrapping_pow(y))
            }
            Builtin::Rand => {
                arity(1, 2)?;
                let (lo, hi) = if args.len() == 2 {
                    (int_arg(0)?, int_arg(1)?)
                } else {
                    (0, int_arg(0)?)
                };
                if hi <= lo {
                    return Err(format!("RAND: empty range {lo}..{hi}"));
                }
                let Some(rand) = rand else {
                    return Err("RAND cannot be evaluated as a constant".to_owned());
                };
                let span = (hi - lo) as u64;
                ScalarValue::Int(lo + (rand() % span) as i64)
            }
            Builtin::StrLenS => {
                arity(1, 1)?;
                ScalarValue::Int(str_arg(0)?.chars().count() as i64)
            }
            Builtin::ToStr => {
                arity(1, 1)?;
                ScalarValue::Str(int_arg(0)?.to_string())
            }
            Builtin::ToInt => {
                arity(1, 1)?;
                ScalarValue::Int(str_arg(0)?.trim().parse().unwrap_or(0))
            }
            Builtin::IsNumeric => {
                arity(1, 1)?;
                ScalarValue::Int(str_arg(0)?.trim().parse::<i64>().is_ok() as i64)
            }
            Builtin::Unicode => {
                arity(1, 1)?;
                let code = u32::try_from(int_arg(0)?).ok().and_then(char::from_u32);
                let code = code.ok_or_else(|| "UNICODE: invalid code point".to_owned())?;
                ScalarValue::Str(code.to_string())
            }
        })
    })();
    Some(result)
}

pub fn is_builtin_method(name: &str) -> bool {
    call_builtin(name, &[], None).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::EraExprCtx;

    fn eval(src: &str) -> Result<ScalarValue, EraInterpretError> {
        let expr = EraExprCtx::new(None, true)
            .parse_expr(src, 0)
            .expect("parse failed");
        let lookup = |name: &str, idx: &[i64]| match (name, idx) {
            ("B", []) => Some(ScalarValue::Int(2)),
            ("NAME", []) => Some(ScalarValue::Str("Ann".to_owned())),
            _ => None,
        };
        EraInterpreter::new(&lookup).interpret_expression(&expr)
    }

    #[test]
    fn constant_arithmetic() {
        assert_eq!(eval("B + 1"), Ok(ScalarValue::Int(3)));
        assert_eq!(eval("(1 << 4) | 3"), Ok(ScalarValue::Int(19)));
        assert_eq!(eval("MAX(1, B, -3)"), Ok(ScalarValue::Int(2)));
        assert_eq!(eval("B > 1 ? 10 # 20"), Ok(ScalarValue::Int(10)));
        assert_eq!(eval("\"ab\" * 2 + NAME"), Ok(ScalarValue::Str("ababAnn".to_owned())));
        assert_eq!(eval("0 && 1 / 0"), Ok(ScalarValue::Int(0)));
    }

    #[test]
    fn constant_failures() {
        assert!(matches!(eval("C + 1"), Err(EraInterpretError::VarNotFound(name, _)) if name == "C"));
        assert!(matches!(eval("1 / 0"), Err(EraInterpretError::Others(..))));
        assert!(matches!(eval("RAND(3)"), Err(EraInterpretError::Others(..))));
        assert!(matches!(eval("1 + \"x\""), Err(EraInterpretError::Others(..))));
    }

    #[test]
    fn padding() {
        assert_eq!(pad_text("ab".to_owned(), Some(4), false), "  ab");
        assert_eq!(pad_text("ab".to_owned(), Some(4), true), "ab  ");
        assert_eq!(pad_text("abcde".to_owned(), Some(4), true), "abcde");
    }
}
