//! Expression evaluator
//!
//! Recursive descent directly over the expression text, no token pass.
//! Spaces and tabs are skipped before every token.
//!
//! ```text
//! expression  := comparison
//! comparison  := ['+'|'-'] additive ( cmpOp ['+'|'-'] additive )?
//! additive    := term ( ('+'|'-') term )*
//! term        := power ( '*' power | ('/'|'%') term )*
//! power       := primary ( '^' power )?
//! primary     := number | '(' expression ')' | identifier [ '(' args ')' ]
//! ```
//!
//! The right operand of `/` and `%` is a whole `term`, so `8/2/2` is
//! `8/(2/2)`. Comparisons yield `1.0` or `0.0` and compose with arithmetic.

use heapless::Vec as HVec;
use thiserror::Error;

use super::variables::TempVars;

/// Tolerance for `==` and `!=`
pub const EQUALITY_EPSILON: f64 = 1e-6;

/// A condition is true when its magnitude exceeds this
pub const TRUTH_EPSILON: f64 = 1e-6;

/// Maximum nesting of parentheses, calls and right-recursive operators
pub const MAX_NESTING_DEPTH: usize = 64;

/// Largest argument list accepted by any built-in
const MAX_ARGS: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExprError {
    #[error("unexpected end of expression")]
    UnexpectedEnd,

    #[error("unexpected character '{0}'")]
    UnexpectedChar(char),

    #[error("invalid number '{0}'")]
    InvalidNumber(String),

    #[error("missing closing parenthesis")]
    UnclosedParen,

    #[error("unknown variable or function '{0}'")]
    UnknownIdentifier(String),

    #[error("unknown function '{0}'")]
    UnknownFunction(String),

    #[error("{function}() expects {expected} argument(s), got {found}")]
    ArgumentCount {
        function: &'static str,
        expected: usize,
        found: usize,
    },

    #[error("invalid comparison operator '{0}'")]
    InvalidComparison(char),

    #[error("division by zero")]
    DivisionByZero,

    #[error("square root of negative number")]
    NegativeSqrt,

    #[error("logarithm of non-positive number")]
    NonPositiveLog,

    #[error("unexpected trailing characters '{0}'")]
    TrailingCharacters(String),

    #[error("expression nested too deeply (max {0})")]
    TooDeep(usize),
}

type Result<T> = std::result::Result<T, ExprError>;

/// Evaluate a numeric expression against the temporary variables
pub fn evaluate(expression: &str, vars: &TempVars) -> Result<f64> {
    let mut parser = Parser {
        text: expression,
        pos: 0,
        depth: 0,
        vars,
    };

    let value = parser.expression()?;
    parser.skip_whitespace();
    if parser.pos < parser.text.len() {
        return Err(ExprError::TrailingCharacters(
            parser.text[parser.pos..].to_string(),
        ));
    }
    Ok(value)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Comparison {
    Greater,
    GreaterEqual,
    Less,
    LessEqual,
    Equal,
    NotEqual,
}

impl Comparison {
    fn apply(self, left: f64, right: f64) -> bool {
        match self {
            Comparison::Greater => left > right,
            Comparison::GreaterEqual => left >= right,
            Comparison::Less => left < right,
            Comparison::LessEqual => left <= right,
            Comparison::Equal => (left - right).abs() < EQUALITY_EPSILON,
            Comparison::NotEqual => (left - right).abs() >= EQUALITY_EPSILON,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Function {
    Sin,
    Cos,
    Tan,
    Sqrt,
    Abs,
    Log,
    Exp,
    Pow,
    If,
}

impl Function {
    fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "sin" => Function::Sin,
            "cos" => Function::Cos,
            "tan" => Function::Tan,
            "sqrt" => Function::Sqrt,
            "abs" => Function::Abs,
            "log" => Function::Log,
            "exp" => Function::Exp,
            "pow" => Function::Pow,
            "if" => Function::If,
            _ => return None,
        })
    }

    fn name(self) -> &'static str {
        match self {
            Function::Sin => "sin",
            Function::Cos => "cos",
            Function::Tan => "tan",
            Function::Sqrt => "sqrt",
            Function::Abs => "abs",
            Function::Log => "log",
            Function::Exp => "exp",
            Function::Pow => "pow",
            Function::If => "if",
        }
    }

    fn arity(self) -> usize {
        match self {
            Function::Pow => 2,
            Function::If => 3,
            _ => 1,
        }
    }

    fn apply(self, args: &[f64]) -> Result<f64> {
        match (self, args) {
            (Function::Sin, [x]) => Ok(x.sin()),
            (Function::Cos, [x]) => Ok(x.cos()),
            (Function::Tan, [x]) => Ok(x.tan()),
            (Function::Sqrt, [x]) if *x < 0.0 => Err(ExprError::NegativeSqrt),
            (Function::Sqrt, [x]) => Ok(x.sqrt()),
            (Function::Abs, [x]) => Ok(x.abs()),
            (Function::Log, [x]) if *x <= 0.0 => Err(ExprError::NonPositiveLog),
            (Function::Log, [x]) => Ok(x.ln()),
            (Function::Exp, [x]) => Ok(x.exp()),
            (Function::Pow, [base, exponent]) => Ok(base.powf(*exponent)),
            (Function::If, [condition, when_true, when_false]) => {
                if condition.abs() > TRUTH_EPSILON {
                    Ok(*when_true)
                } else {
                    Ok(*when_false)
                }
            }
            _ => Err(ExprError::ArgumentCount {
                function: self.name(),
                expected: self.arity(),
                found: args.len(),
            }),
        }
    }
}

struct Parser<'a> {
    text: &'a str,
    pos: usize,
    depth: usize,
    vars: &'a TempVars,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<u8> {
        self.text.as_bytes().get(self.pos).copied()
    }

    fn current_char(&self) -> char {
        self.text[self.pos..].chars().next().unwrap_or('\0')
    }

    fn eat(&mut self, byte: u8) -> bool {
        if self.peek() == Some(byte) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn skip_whitespace(&mut self) {
        while matches!(self.peek(), Some(b' ' | b'\t')) {
            self.pos += 1;
        }
    }

    /// Run a recursive rule one level deeper
    fn nested(&mut self, rule: fn(&mut Self) -> Result<f64>) -> Result<f64> {
        if self.depth >= MAX_NESTING_DEPTH {
            return Err(ExprError::TooDeep(MAX_NESTING_DEPTH));
        }
        self.depth += 1;
        let result = rule(self);
        self.depth -= 1;
        result
    }

    fn expression(&mut self) -> Result<f64> {
        self.nested(Self::comparison)
    }

    fn comparison(&mut self) -> Result<f64> {
        let left = self.signed_additive()?;
        self.skip_whitespace();

        let Some(op) = self.comparison_operator()? else {
            return Ok(left);
        };

        let right = self.signed_additive()?;
        Ok(if op.apply(left, right) { 1.0 } else { 0.0 })
    }

    fn comparison_operator(&mut self) -> Result<Option<Comparison>> {
        let first = match self.peek() {
            Some(c @ (b'>' | b'<' | b'=' | b'!')) => c,
            _ => return Ok(None),
        };
        self.pos += 1;
        let or_equal = self.eat(b'=');

        let op = match (first, or_equal) {
            (b'>', false) => Comparison::Greater,
            (b'>', true) => Comparison::GreaterEqual,
            (b'<', false) => Comparison::Less,
            (b'<', true) => Comparison::LessEqual,
            (b'=', true) => Comparison::Equal,
            (b'!', true) => Comparison::NotEqual,
            (c, _) => return Err(ExprError::InvalidComparison(c as char)),
        };
        Ok(Some(op))
    }

    /// Additive with an optional leading sign on its first term
    fn signed_additive(&mut self) -> Result<f64> {
        self.skip_whitespace();
        let negate = if self.eat(b'-') {
            true
        } else {
            self.eat(b'+');
            false
        };

        let mut value = self.term()?;
        if negate {
            value = -value;
        }

        loop {
            self.skip_whitespace();
            if self.eat(b'+') {
                value += self.term()?;
            } else if self.eat(b'-') {
                value -= self.term()?;
            } else {
                return Ok(value);
            }
        }
    }

    fn term(&mut self) -> Result<f64> {
        let mut value = self.power()?;

        loop {
            self.skip_whitespace();
            match self.peek() {
                Some(b'*') => {
                    self.pos += 1;
                    value *= self.power()?;
                }
                Some(b'/') => {
                    self.pos += 1;
                    let divisor = self.nested(Self::term)?;
                    if divisor == 0.0 {
                        return Err(ExprError::DivisionByZero);
                    }
                    value /= divisor;
                }
                Some(b'%') => {
                    self.pos += 1;
                    // f64 remainder: sign follows the dividend
                    value %= self.nested(Self::term)?;
                }
                _ => return Ok(value),
            }
        }
    }

    fn power(&mut self) -> Result<f64> {
        let base = self.primary()?;
        self.skip_whitespace();

        if self.eat(b'^') {
            let exponent = self.nested(Self::power)?;
            Ok(base.powf(exponent))
        } else {
            Ok(base)
        }
    }

    fn primary(&mut self) -> Result<f64> {
        self.skip_whitespace();

        match self.peek() {
            None => Err(ExprError::UnexpectedEnd),
            Some(c) if c.is_ascii_digit() || c == b'.' => self.number(),
            Some(sign @ (b'+' | b'-')) => {
                if self.sign_starts_number() {
                    self.number()
                } else {
                    self.pos += 1;
                    let value = self.nested(Self::primary)?;
                    Ok(if sign == b'-' { -value } else { value })
                }
            }
            Some(b'(') => {
                self.pos += 1;
                let value = self.expression()?;
                self.skip_whitespace();
                if !self.eat(b')') {
                    return Err(ExprError::UnclosedParen);
                }
                Ok(value)
            }
            Some(c) if c.is_ascii_alphabetic() || c == b'_' => self.identifier(),
            Some(_) => Err(ExprError::UnexpectedChar(self.current_char())),
        }
    }

    fn sign_starts_number(&self) -> bool {
        matches!(
            self.text.as_bytes().get(self.pos + 1),
            Some(c) if c.is_ascii_digit() || *c == b'.'
        )
    }

    fn count_digits(&self, from: usize) -> usize {
        self.text.as_bytes()[from.min(self.text.len())..]
            .iter()
            .take_while(|c| c.is_ascii_digit())
            .count()
    }

    /// Decimal literal with optional sign, fraction and exponent
    fn number(&mut self) -> Result<f64> {
        let bytes = self.text.as_bytes();
        let start = self.pos;
        let mut end = start;

        if matches!(bytes.get(end), Some(b'+' | b'-')) {
            end += 1;
        }

        let int_digits = self.count_digits(end);
        end += int_digits;

        let mut frac_digits = 0;
        if bytes.get(end) == Some(&b'.') {
            end += 1;
            frac_digits = self.count_digits(end);
            end += frac_digits;
        }

        if int_digits + frac_digits == 0 {
            return Err(ExprError::InvalidNumber(self.text[start..end].to_string()));
        }

        if matches!(bytes.get(end), Some(b'e' | b'E')) {
            let mut exp_end = end + 1;
            if matches!(bytes.get(exp_end), Some(b'+' | b'-')) {
                exp_end += 1;
            }
            let exp_digits = self.count_digits(exp_end);
            if exp_digits > 0 {
                end = exp_end + exp_digits;
            }
        }

        let literal = &self.text[start..end];
        let value = literal
            .parse::<f64>()
            .map_err(|_| ExprError::InvalidNumber(literal.to_string()))?;
        self.pos = end;
        Ok(value)
    }

    fn identifier(&mut self) -> Result<f64> {
        let text = self.text;
        let start = self.pos;
        while matches!(self.peek(), Some(c) if c.is_ascii_alphanumeric() || c == b'_') {
            self.pos += 1;
        }
        let name = &text[start..self.pos];

        self.skip_whitespace();
        if self.eat(b'(') {
            return self.call(name);
        }

        self.vars
            .get(name)
            .ok_or_else(|| ExprError::UnknownIdentifier(name.to_string()))
    }

    fn call(&mut self, name: &str) -> Result<f64> {
        let function =
            Function::from_name(name).ok_or_else(|| ExprError::UnknownFunction(name.to_string()))?;

        let mut args: HVec<f64, MAX_ARGS> = HVec::new();
        let mut found = 0;

        self.skip_whitespace();
        if !self.eat(b')') {
            loop {
                let value = self.expression()?;
                found += 1;
                // overflow is reported below as an argument count error
                let _ = args.push(value);

                self.skip_whitespace();
                match self.peek() {
                    Some(b',') => self.pos += 1,
                    Some(b')') => {
                        self.pos += 1;
                        break;
                    }
                    None => return Err(ExprError::UnclosedParen),
                    Some(_) => return Err(ExprError::UnexpectedChar(self.current_char())),
                }
            }
        }

        if found != function.arity() {
            return Err(ExprError::ArgumentCount {
                function: function.name(),
                expected: function.arity(),
                found,
            });
        }

        function.apply(&args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eval(expression: &str) -> Result<f64> {
        evaluate(expression, &TempVars::new())
    }

    fn assert_close(expression: &str, expected: f64) {
        let value = eval(expression).unwrap();
        assert!(
            (value - expected).abs() < 1e-9,
            "{} = {}, expected {}",
            expression,
            value,
            expected
        );
    }

    // ========================================================================
    // Precedence
    // ========================================================================

    #[test]
    fn test_operator_precedence() {
        assert_close("2+3*4", 14.0);
        assert_close("(2+3)*4", 20.0);
        assert_close("2^3^2", 512.0);
        assert_close("10 - 4 - 3", 3.0);
        assert_close("2 * 3 + 4 * 5", 26.0);
        assert_close("-2^2", -4.0);
        assert_close(" 1 +\t2 ", 3.0);
    }

    #[test]
    fn test_division_groups_to_the_right() {
        assert_close("8/2/2", 8.0);
        assert_close("8/2*2", 2.0);
        assert_close("2*3/4", 1.5);
        assert_close("10 % 4", 2.0);
        assert_close("-7 % 3", -1.0);
    }

    #[test]
    fn test_numbers() {
        assert_close("1.5", 1.5);
        assert_close(".5", 0.5);
        assert_close("1.", 1.0);
        assert_close("1e3", 1000.0);
        assert_close("2.5E-1", 0.25);
        assert_close("+4", 4.0);
        assert_close("3 - -2", 5.0);
        assert_close("2*-(3+1)", -8.0);
    }

    // ========================================================================
    // Comparisons
    // ========================================================================

    #[test]
    fn test_comparison_epsilon() {
        assert_eq!(eval("5 == 5.0000001").unwrap(), 1.0);
        assert_eq!(eval("5 == 5.1").unwrap(), 0.0);
        assert_eq!(eval("5 != 5.1").unwrap(), 1.0);
        assert_eq!(eval("5 != 5.0000001").unwrap(), 0.0);
    }

    #[test]
    fn test_comparison_operators() {
        assert_eq!(eval("3 > 2").unwrap(), 1.0);
        assert_eq!(eval("3 < 2").unwrap(), 0.0);
        assert_eq!(eval("2 >= 2").unwrap(), 1.0);
        assert_eq!(eval("2 <= 1").unwrap(), 0.0);
        assert_eq!(eval("1 + 2 > 2").unwrap(), 1.0);
        assert_eq!(eval("-3 < -2").unwrap(), 1.0);
    }

    #[test]
    fn test_comparison_composes_with_arithmetic() {
        assert_close("(3 > 2) + (4 > 1)", 2.0);
        assert_close("10 * (1 == 1)", 10.0);
    }

    #[test]
    fn test_invalid_comparison_operator() {
        assert_eq!(eval("3 = 2"), Err(ExprError::InvalidComparison('=')));
        assert_eq!(eval("3 ! 2"), Err(ExprError::InvalidComparison('!')));
    }

    // ========================================================================
    // Functions
    // ========================================================================

    #[test]
    fn test_conditional() {
        assert_eq!(eval("if(1>0, 10, 20)").unwrap(), 10.0);
        assert_eq!(eval("if(0, 10, 20)").unwrap(), 20.0);
        assert_eq!(eval("if(0.0000001, 10, 20)").unwrap(), 20.0);
        assert_eq!(eval("if(-1, 10, 20)").unwrap(), 10.0);
    }

    #[test]
    fn test_math_functions() {
        assert_close("sqrt(16)", 4.0);
        assert_close("abs(-3.5)", 3.5);
        assert_close("pow(2, 10)", 1024.0);
        assert_close("log(exp(2))", 2.0);
        assert_close("sin(0) + cos(0)", 1.0);
        assert_close("tan(0)", 0.0);
        assert_close("sqrt (4) * 2", 4.0);
        assert_close("pow(if(1,2,3), sqrt(9))", 8.0);
    }

    #[test]
    fn test_function_domain_errors() {
        assert_eq!(eval("sqrt(-1)"), Err(ExprError::NegativeSqrt));
        assert_eq!(eval("log(0)"), Err(ExprError::NonPositiveLog));
        assert_eq!(eval("log(-2)"), Err(ExprError::NonPositiveLog));
    }

    #[test]
    fn test_argument_count() {
        assert_eq!(
            eval("pow(2)"),
            Err(ExprError::ArgumentCount {
                function: "pow",
                expected: 2,
                found: 1
            })
        );
        assert_eq!(
            eval("if(1, 2)"),
            Err(ExprError::ArgumentCount {
                function: "if",
                expected: 3,
                found: 2
            })
        );
        assert!(matches!(
            eval("sqrt(1, 2, 3, 4)"),
            Err(ExprError::ArgumentCount { found: 4, .. })
        ));
        assert!(matches!(
            eval("abs()"),
            Err(ExprError::ArgumentCount { found: 0, .. })
        ));
    }

    #[test]
    fn test_unknown_names() {
        assert_eq!(
            eval("foo(1)"),
            Err(ExprError::UnknownFunction("foo".to_string()))
        );
        assert_eq!(
            eval("x + 1"),
            Err(ExprError::UnknownIdentifier("x".to_string()))
        );
    }

    // ========================================================================
    // Variables
    // ========================================================================

    #[test]
    fn test_variables() {
        let mut vars = TempVars::new();
        vars.set("flow", 2.5).unwrap();
        vars.set("level", 4.0).unwrap();

        assert_eq!(evaluate("flow * 2", &vars).unwrap(), 5.0);
        assert_eq!(evaluate("level + flow", &vars).unwrap(), 6.5);
        assert_eq!(evaluate("levelX", &vars).unwrap(), 4.0);
    }

    // ========================================================================
    // Errors
    // ========================================================================

    #[test]
    fn test_division_by_zero() {
        assert_eq!(eval("1/0"), Err(ExprError::DivisionByZero));
        assert_eq!(eval("1/(2-2)"), Err(ExprError::DivisionByZero));
        assert!(eval("5 % 0").unwrap().is_nan());
    }

    #[test]
    fn test_syntax_errors() {
        assert_eq!(eval(""), Err(ExprError::UnexpectedEnd));
        assert_eq!(eval("2 +"), Err(ExprError::UnexpectedEnd));
        assert_eq!(eval("(2 + 3"), Err(ExprError::UnclosedParen));
        assert_eq!(eval("sqrt(4"), Err(ExprError::UnclosedParen));
        assert_eq!(eval("2 * #"), Err(ExprError::UnexpectedChar('#')));
        assert_eq!(
            eval("2 3"),
            Err(ExprError::TrailingCharacters("3".to_string()))
        );
        assert_eq!(
            eval("4 )"),
            Err(ExprError::TrailingCharacters(")".to_string()))
        );
        assert_eq!(eval("{d[0][0]}"), Err(ExprError::UnexpectedChar('{')));
    }

    #[test]
    fn test_nesting_limit() {
        let deep = format!("{}1{}", "(".repeat(200), ")".repeat(200));
        assert_eq!(eval(&deep), Err(ExprError::TooDeep(MAX_NESTING_DEPTH)));

        let ok = format!("{}1{}", "(".repeat(20), ")".repeat(20));
        assert_close(&ok, 1.0);
    }
}
