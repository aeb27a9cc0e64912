//! Arithmetic expressions over iteration arguments.
//!
//! Expressions appear in templates and patterns wherever an integer is expected, for example
//! `($1 + 0x800)` for a field that changes with every iteration. The syntax is small and fully
//! parenthesised, there is no operator precedence to remember:
//!
//! * constants in decimal, hexadecimal `0x1f` or octal `017`,
//! * argument references `$1`, `$2`, ... (counted from one),
//! * unary minus `(-a)`, or `-a` in front of any operand,
//! * binary operations `(a + b)`, `(a - b)`, `(a * b)`, `(a / b)` and `(a % b)`.
//!
//! A negative literal is a negation of a positive constant. Printing an expression yields text that
//! parses back to the same tree.
use core::{convert::TryFrom, fmt, str::FromStr};

use crate::args::Arg;
use crate::error::{Error, Result};

/// A node of the expression tree.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Expr {
    /// An integer constant.
    Const(i64),
    /// Reference to an iteration argument, counted from 1.
    Arg(usize),
    /// Arithmetic negation.
    Neg(Box<Expr>),
    /// A binary operation.
    Binary(BinOp, Box<Expr>, Box<Expr>),
}

/// Binary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

impl BinOp {
    fn symbol(self) -> char {
        match self {
            BinOp::Add => '+',
            BinOp::Sub => '-',
            BinOp::Mul => '*',
            BinOp::Div => '/',
            BinOp::Rem => '%',
        }
    }

    fn from_symbol(symbol: u8) -> Option<Self> {
        match symbol {
            b'+' => Some(BinOp::Add),
            b'-' => Some(BinOp::Sub),
            b'*' => Some(BinOp::Mul),
            b'/' => Some(BinOp::Div),
            b'%' => Some(BinOp::Rem),
            _ => None,
        }
    }

    fn apply(self, lhs: i64, rhs: i64) -> Result<i64> {
        let result = match self {
            BinOp::Add => lhs.checked_add(rhs),
            BinOp::Sub => lhs.checked_sub(rhs),
            BinOp::Mul => lhs.checked_mul(rhs),
            BinOp::Div | BinOp::Rem if rhs == 0 => {
                return Err(Error::ExprEval("division by zero".into()));
            },
            BinOp::Div => lhs.checked_div(rhs),
            BinOp::Rem => lhs.checked_rem(rhs),
        };

        result.ok_or_else(|| Error::ExprEval(format!(
            "overflow in {} {} {}", lhs, self.symbol(), rhs)))
    }
}

impl Expr {
    /// Shorthand for a binary node.
    pub fn binary(op: BinOp, lhs: Expr, rhs: Expr) -> Self {
        Expr::Binary(op, Box::new(lhs), Box::new(rhs))
    }

    /// Shorthand for a negation node.
    pub fn neg(inner: Expr) -> Self {
        Expr::Neg(Box::new(inner))
    }

    /// Evaluate against the arguments of the current iteration.
    ///
    /// Fails when an argument is missing or not an integer, on division by zero and when any
    /// intermediate result leaves the 64-bit signed range.
    pub fn eval(&self, args: &[Arg]) -> Result<i64> {
        match self {
            Expr::Const(value) => Ok(*value),
            Expr::Arg(idx) => {
                let arg = idx
                    .checked_sub(1)
                    .and_then(|idx| args.get(idx))
                    .ok_or_else(|| Error::ExprEval(format!("undefined argument ${}", idx)))?;
                match arg {
                    Arg::Int(value) => Ok(*value),
                    Arg::Str(_) => Err(Error::ExprEval(format!("argument ${} is not an integer", idx))),
                }
            },
            Expr::Neg(inner) => {
                let value = inner.eval(args)?;
                value.checked_neg()
                    .ok_or_else(|| Error::ExprEval(format!("overflow negating {}", value)))
            },
            Expr::Binary(op, lhs, rhs) => {
                let lhs = lhs.eval(args)?;
                let rhs = rhs.eval(args)?;
                op.apply(lhs, rhs)
            },
        }
    }

    /// Whether the expression refers to no argument at all.
    pub fn is_constant(&self) -> bool {
        match self {
            Expr::Const(_) => true,
            Expr::Arg(_) => false,
            Expr::Neg(inner) => inner.is_constant(),
            Expr::Binary(_, lhs, rhs) => lhs.is_constant() && rhs.is_constant(),
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            // The magnitude of the smallest value is no constant of its own.
            Expr::Const(i64::MIN) => write!(f, "((-{}) - 1)", i64::MAX),
            Expr::Const(value) if *value < 0 => write!(f, "(-{})", value.unsigned_abs()),
            Expr::Const(value) => write!(f, "{}", value),
            Expr::Arg(idx) => write!(f, "${}", idx),
            Expr::Neg(inner) => write!(f, "(-{})", inner),
            Expr::Binary(op, lhs, rhs) => write!(f, "({} {} {})", lhs, op.symbol(), rhs),
        }
    }
}

impl FromStr for Expr {
    type Err = Error;

    fn from_str(text: &str) -> Result<Self> {
        let mut parser = Parser { text: text.as_bytes(), pos: 0 };
        let expr = parser.expr()?;
        parser.skip_ws();
        if parser.pos != parser.text.len() {
            return Err(parser.error("trailing characters"));
        }
        Ok(expr)
    }
}

struct Parser<'a> {
    text: &'a [u8],
    pos: usize,
}

impl Parser<'_> {
    fn skip_ws(&mut self) {
        while self.text.get(self.pos).map_or(false, u8::is_ascii_whitespace) {
            self.pos += 1;
        }
    }

    fn peek(&mut self) -> Option<u8> {
        self.skip_ws();
        self.text.get(self.pos).copied()
    }

    fn error(&self, what: &str) -> Error {
        Error::ExprParse(format!("{} at offset {}", what, self.pos))
    }

    fn expect(&mut self, token: u8) -> Result<()> {
        if self.peek() == Some(token) {
            self.pos += 1;
            Ok(())
        } else {
            Err(self.error(&format!("expected '{}'", token as char)))
        }
    }

    fn expr(&mut self) -> Result<Expr> {
        match self.peek() {
            Some(b'(') => {
                self.pos += 1;
                let inner = self.inner()?;
                self.expect(b')')?;
                Ok(inner)
            },
            Some(b'-') => {
                self.pos += 1;
                Ok(Expr::neg(self.expr()?))
            },
            Some(b'$') => {
                self.pos += 1;
                let idx = self.digits(10)?;
                let idx = usize::try_from(idx)
                    .map_err(|_| self.error("argument index too large"))?;
                if idx == 0 {
                    return Err(self.error("arguments are counted from $1"));
                }
                Ok(Expr::Arg(idx))
            },
            Some(digit) if digit.is_ascii_digit() => self.constant(),
            Some(_) => Err(self.error("unexpected character")),
            None => Err(self.error("unexpected end")),
        }
    }

    /// The content of a parenthesised group.
    fn inner(&mut self) -> Result<Expr> {
        let lhs = self.expr()?;
        let op = match self.peek() {
            Some(b')') => return Ok(lhs),
            Some(symbol) => BinOp::from_symbol(symbol)
                .ok_or_else(|| self.error("expected operator"))?,
            None => return Err(self.error("unexpected end")),
        };
        self.pos += 1;
        let rhs = self.expr()?;
        Ok(Expr::binary(op, lhs, rhs))
    }

    fn constant(&mut self) -> Result<Expr> {
        let rest = &self.text[self.pos..];
        let value = if rest.len() > 1 && rest[0] == b'0' && (rest[1] == b'x' || rest[1] == b'X') {
            self.pos += 2;
            self.digits(16)?
        } else if rest.len() > 1 && rest[0] == b'0' && rest[1].is_ascii_digit() {
            self.pos += 1;
            self.digits(8)?
        } else {
            self.digits(10)?
        };

        i64::try_from(value)
            .map(Expr::Const)
            .map_err(|_| self.error("constant out of range"))
    }

    fn digits(&mut self, radix: u32) -> Result<u64> {
        let start = self.pos;
        while self.text.get(self.pos).map_or(false, |c| c.is_ascii_alphanumeric()) {
            self.pos += 1;
        }
        // Only ascii was consumed.
        let digits = core::str::from_utf8(&self.text[start..self.pos])
            .map_err(|_| self.error("invalid number"))?;
        if digits.is_empty() {
            return Err(self.error("expected digits"));
        }
        u64::from_str_radix(digits, radix)
            .map_err(|_| self.error("invalid number"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> Expr {
        text.parse().unwrap()
    }

    #[test]
    fn constants() {
        assert_eq!(parse("42"), Expr::Const(42));
        assert_eq!(parse("0x1F"), Expr::Const(31));
        assert_eq!(parse("017"), Expr::Const(15));
        assert_eq!(parse("0"), Expr::Const(0));
        assert_eq!(parse("-5"), Expr::neg(Expr::Const(5)));
        assert!("09".parse::<Expr>().is_err());
        assert!("0x".parse::<Expr>().is_err());
        assert!("99999999999999999999".parse::<Expr>().is_err());
    }

    #[test]
    fn nested() {
        let expr = parse("(($1 + 0x10) * (-2))");
        assert_eq!(expr, Expr::binary(BinOp::Mul,
            Expr::binary(BinOp::Add, Expr::Arg(1), Expr::Const(16)),
            Expr::neg(Expr::Const(2))));
        assert_eq!(expr.eval(&[Arg::Int(4)]), Ok(-40));
        assert!(!expr.is_constant());
    }

    #[test]
    fn syntax_errors() {
        for bad in &["", "(", "(1 +", "(1 ^ 2)", "$0", "$", "(1 2)", "1)", "(1 + 2"] {
            let err = bad.parse::<Expr>().unwrap_err();
            assert!(matches!(err, Error::ExprParse(_)), "{:?} gave {:?}", bad, err);
        }
    }

    #[test]
    fn evaluation_errors() {
        let undefined = parse("($2 + 1)");
        assert!(matches!(undefined.eval(&[Arg::Int(1)]), Err(Error::ExprEval(_))));

        let string = parse("$1");
        assert!(matches!(string.eval(&[Arg::Str("a".into())]), Err(Error::ExprEval(_))));

        assert!(matches!(parse("(1 / 0)").eval(&[]), Err(Error::ExprEval(_))));
        assert!(matches!(parse("(1 % 0)").eval(&[]), Err(Error::ExprEval(_))));
        assert!(matches!(parse("(0x7fffffffffffffff + 1)").eval(&[]), Err(Error::ExprEval(_))));
        assert!(matches!(parse("(0x4000000000000000 * 2)").eval(&[]), Err(Error::ExprEval(_))));
        assert_eq!(parse("(7 % 3)").eval(&[]), Ok(1));
        assert_eq!(parse("(-7 / 2)").eval(&[]), Ok(-3));
    }

    #[test]
    fn print_parses_back() {
        let exprs = [
            parse("(($1 + 0x10) * (-2))"),
            parse("-(-$3)"),
            parse("((1 - 2) % ($2 / 017))"),
            Expr::Const(-12),
            Expr::Const(i64::MIN),
        ];
        for expr in exprs.iter() {
            let text = expr.to_string();
            let reparsed = parse(&text);
            assert_eq!(reparsed.eval(&[Arg::Int(3), Arg::Int(5), Arg::Int(7)]),
                       expr.eval(&[Arg::Int(3), Arg::Int(5), Arg::Int(7)]));
            assert_eq!(reparsed.to_string(), text);
        }
        assert_eq!(parse("(($1 + 0x10) * (-2))").to_string(), "(($1 + 16) * (-2))");
        assert_eq!(parse(&Expr::Const(i64::MIN).to_string()).eval(&[]), Ok(i64::MIN));
    }

    #[test]
    fn transparent() {
        let expr = parse("(($1 * $1) - $2)");
        let args = [Arg::Int(9), Arg::Int(1)];
        assert_eq!(expr.eval(&args), expr.eval(&args));
        assert_eq!(expr.eval(&args), Ok(80));
    }
}
