//! Arithmetic formula engine.
//!
//! Source text goes through three stages: tokenize, validate, parse. Syntax
//! validation runs before any parsing or evaluation and rejects unbalanced
//! parentheses, consecutive operators, a leading multiplicative operator and
//! a trailing operator. Evaluation resolves identifiers through a caller
//! supplied lookup so the same engine serves formula nodes (context
//! variables) and expression transforms (record fields).

use crate::NodeError;

/// Function names accepted in call position.
pub const FUNCTIONS: &[&str] = &[
    "sqrt", "abs", "round", "min", "max", "sin", "cos", "tan", "log", "exp", "pow",
];

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Ident(String),
    Op(char),
    LParen,
    RParen,
    Comma,
}

impl Token {
    fn is_operator(&self) -> bool {
        matches!(self, Token::Op(_))
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Number(f64),
    Var(String),
    Neg(Box<Expr>),
    Binary(char, Box<Expr>, Box<Expr>),
    Call(String, Vec<Expr>),
}

/// A validated, parsed formula.
#[derive(Debug, Clone, PartialEq)]
pub struct Formula {
    source: String,
    expr: Expr,
}

fn syntax(msg: impl Into<String>) -> NodeError {
    NodeError::FormulaSyntax(msg.into())
}

fn tokenize(src: &str) -> Result<Vec<Token>, NodeError> {
    let chars: Vec<char> = src.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\n' | '\r' => i += 1,
            '0'..='9' | '.' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                // exponent part: 1e3, 2.5E-4
                if i < chars.len() && (chars[i] == 'e' || chars[i] == 'E') {
                    let mut j = i + 1;
                    if j < chars.len() && (chars[j] == '+' || chars[j] == '-') {
                        j += 1;
                    }
                    if j < chars.len() && chars[j].is_ascii_digit() {
                        i = j;
                        while i < chars.len() && chars[i].is_ascii_digit() {
                            i += 1;
                        }
                    }
                }
                let text: String = chars[start..i].iter().collect();
                let n = text
                    .parse::<f64>()
                    .map_err(|_| syntax(format!("invalid number '{text}'")))?;
                tokens.push(Token::Number(n));
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '.')
                {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            '+' | '-' | '*' | '/' | '%' | '^' => {
                tokens.push(Token::Op(c));
                i += 1;
            }
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            other => return Err(syntax(format!("unexpected character '{other}' at {i}"))),
        }
    }
    Ok(tokens)
}

fn check_tokens(tokens: &[Token]) -> Result<(), NodeError> {
    let Some(first) = tokens.first() else {
        return Err(syntax("empty formula"));
    };
    if let Token::Op(op @ ('*' | '/' | '%' | '^')) = first {
        return Err(syntax(format!("formula cannot start with '{op}'")));
    }
    if let Some(Token::Op(op)) = tokens.last() {
        return Err(syntax(format!("formula cannot end with '{op}'")));
    }

    let mut depth: i32 = 0;
    for (idx, token) in tokens.iter().enumerate() {
        match token {
            Token::LParen => depth += 1,
            Token::RParen => {
                depth -= 1;
                if depth < 0 {
                    return Err(syntax("unbalanced parentheses: unexpected ')'"));
                }
            }
            Token::Op(op) => {
                if let Some(next) = tokens.get(idx + 1) {
                    if next.is_operator() {
                        return Err(syntax(format!(
                            "consecutive operators '{op}' and '{}'",
                            match next {
                                Token::Op(n) => *n,
                                _ => '?',
                            }
                        )));
                    }
                    if *next == Token::RParen {
                        return Err(syntax(format!("operator '{op}' before ')'")));
                    }
                }
            }
            _ => {}
        }
    }
    if depth != 0 {
        return Err(syntax("unbalanced parentheses: missing ')'"));
    }
    Ok(())
}

/// Syntax validation without evaluation.
pub fn validate(src: &str) -> Result<(), NodeError> {
    check_tokens(&tokenize(src)?)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        t
    }

    fn expr(&mut self) -> Result<Expr, NodeError> {
        let mut lhs = self.term()?;
        while let Some(Token::Op(op @ ('+' | '-'))) = self.peek().cloned() {
            self.pos += 1;
            let rhs = self.term()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn term(&mut self) -> Result<Expr, NodeError> {
        let mut lhs = self.power()?;
        while let Some(Token::Op(op @ ('*' | '/' | '%'))) = self.peek().cloned() {
            self.pos += 1;
            let rhs = self.power()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn power(&mut self) -> Result<Expr, NodeError> {
        let base = self.unary()?;
        if let Some(Token::Op('^')) = self.peek() {
            self.pos += 1;
            // right associative
            let exponent = self.power()?;
            return Ok(Expr::Binary('^', Box::new(base), Box::new(exponent)));
        }
        Ok(base)
    }

    fn unary(&mut self) -> Result<Expr, NodeError> {
        match self.peek() {
            Some(Token::Op('-')) => {
                self.pos += 1;
                Ok(Expr::Neg(Box::new(self.unary()?)))
            }
            Some(Token::Op('+')) => {
                self.pos += 1;
                self.unary()
            }
            _ => self.primary(),
        }
    }

    fn primary(&mut self) -> Result<Expr, NodeError> {
        match self.next() {
            Some(Token::Number(n)) => Ok(Expr::Number(n)),
            Some(Token::Ident(name)) => {
                if let Some(Token::LParen) = self.peek() {
                    self.pos += 1;
                    let lower = name.to_ascii_lowercase();
                    if !FUNCTIONS.contains(&lower.as_str()) {
                        return Err(syntax(format!("unknown function '{name}'")));
                    }
                    let mut args = Vec::new();
                    if let Some(Token::RParen) = self.peek() {
                        self.pos += 1;
                    } else {
                        loop {
                            args.push(self.expr()?);
                            match self.next() {
                                Some(Token::Comma) => continue,
                                Some(Token::RParen) => break,
                                _ => return Err(syntax(format!("expected ',' or ')' in call to '{name}'"))),
                            }
                        }
                    }
                    Ok(Expr::Call(lower, args))
                } else {
                    Ok(Expr::Var(name))
                }
            }
            Some(Token::LParen) => {
                let inner = self.expr()?;
                match self.next() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err(syntax("expected ')'")),
                }
            }
            Some(other) => Err(syntax(format!("unexpected token {other:?}"))),
            None => Err(syntax("unexpected end of formula")),
        }
    }
}

impl Formula {
    /// Validate then parse. Never evaluates anything.
    pub fn parse(src: &str) -> Result<Self, NodeError> {
        let tokens = tokenize(src)?;
        check_tokens(&tokens)?;
        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.expr()?;
        if parser.pos < parser.tokens.len() {
            return Err(syntax(format!(
                "unexpected trailing input at token {}",
                parser.pos
            )));
        }
        Ok(Self {
            source: src.to_string(),
            expr,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Identifiers referenced by the formula, deduplicated, in order.
    pub fn variables(&self) -> Vec<String> {
        fn walk(e: &Expr, out: &mut Vec<String>) {
            match e {
                Expr::Var(v) => {
                    if !out.contains(v) {
                        out.push(v.clone());
                    }
                }
                Expr::Neg(inner) => walk(inner, out),
                Expr::Binary(_, l, r) => {
                    walk(l, out);
                    walk(r, out);
                }
                Expr::Call(_, args) => args.iter().for_each(|a| walk(a, out)),
                Expr::Number(_) => {}
            }
        }
        let mut out = Vec::new();
        walk(&self.expr, &mut out);
        out
    }

    /// Evaluate with identifiers resolved by `lookup`.
    pub fn evaluate<F>(&self, lookup: &F) -> Result<f64, NodeError>
    where
        F: Fn(&str) -> Option<f64>,
    {
        let v = eval(&self.expr, lookup)?;
        if !v.is_finite() {
            return Err(NodeError::FormulaEval(format!(
                "'{}' produced a non-finite result",
                self.source
            )));
        }
        Ok(v)
    }
}

fn eval<F>(expr: &Expr, lookup: &F) -> Result<f64, NodeError>
where
    F: Fn(&str) -> Option<f64>,
{
    match expr {
        Expr::Number(n) => Ok(*n),
        Expr::Var(name) => {
            lookup(name).ok_or_else(|| NodeError::FormulaEval(format!("unknown variable '{name}'")))
        }
        Expr::Neg(inner) => Ok(-eval(inner, lookup)?),
        Expr::Binary(op, l, r) => {
            let a = eval(l, lookup)?;
            let b = eval(r, lookup)?;
            match op {
                '+' => Ok(a + b),
                '-' => Ok(a - b),
                '*' => Ok(a * b),
                '/' => {
                    if b == 0.0 {
                        Err(NodeError::FormulaEval("division by zero".into()))
                    } else {
                        Ok(a / b)
                    }
                }
                '%' => {
                    if b == 0.0 {
                        Err(NodeError::FormulaEval("modulo by zero".into()))
                    } else {
                        Ok(a % b)
                    }
                }
                '^' => Ok(a.powf(b)),
                other => Err(NodeError::FormulaEval(format!("unknown operator '{other}'"))),
            }
        }
        Expr::Call(name, args) => {
            let values = args
                .iter()
                .map(|a| eval(a, lookup))
                .collect::<Result<Vec<_>, _>>()?;
            call(name, &values)
        }
    }
}

fn call(name: &str, args: &[f64]) -> Result<f64, NodeError> {
    let arity = |n: usize| -> Result<(), NodeError> {
        if args.len() == n {
            Ok(())
        } else {
            Err(NodeError::FormulaEval(format!(
                "{name}() expects {n} argument(s), got {}",
                args.len()
            )))
        }
    };
    match name {
        "sqrt" => {
            arity(1)?;
            if args[0] < 0.0 {
                return Err(NodeError::FormulaEval("sqrt of a negative number".into()));
            }
            Ok(args[0].sqrt())
        }
        "abs" => arity(1).map(|_| args[0].abs()),
        "round" => match args.len() {
            1 => Ok(args[0].round()),
            2 => Ok(round_to(args[0], args[1].max(0.0) as u32)),
            n => Err(NodeError::FormulaEval(format!("round() expects 1 or 2 arguments, got {n}"))),
        },
        "min" | "max" => {
            if args.is_empty() {
                return Err(NodeError::FormulaEval(format!("{name}() needs at least one argument")));
            }
            let fold = if name == "min" { f64::min } else { f64::max };
            Ok(args[1..].iter().copied().fold(args[0], fold))
        }
        "sin" => arity(1).map(|_| args[0].sin()),
        "cos" => arity(1).map(|_| args[0].cos()),
        "tan" => arity(1).map(|_| args[0].tan()),
        "log" => {
            arity(1)?;
            if args[0] <= 0.0 {
                return Err(NodeError::FormulaEval("log of a non-positive number".into()));
            }
            Ok(args[0].ln())
        }
        "exp" => arity(1).map(|_| args[0].exp()),
        "pow" => arity(2).map(|_| args[0].powf(args[1])),
        other => Err(NodeError::FormulaEval(format!("unknown function '{other}'"))),
    }
}

/// Round half away from zero to `decimals` places.
pub fn round_to(value: f64, decimals: u32) -> f64 {
    let factor = 10f64.powi(decimals.min(15) as i32);
    (value * factor).round() / factor
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eval_str(src: &str) -> Result<f64, NodeError> {
        Formula::parse(src)?.evaluate(&|_| None)
    }

    #[test]
    fn respects_precedence() {
        assert_eq!(eval_str("2 + 3 * 4").unwrap(), 14.0);
        assert_eq!(eval_str("(2 + 3) * 4").unwrap(), 20.0);
        assert_eq!(eval_str("2 ^ 3 ^ 2").unwrap(), 512.0);
        assert_eq!(eval_str("-2 + 5").unwrap(), 3.0);
    }

    #[test]
    fn rejects_consecutive_operators_before_evaluating() {
        let err = validate("2 +* 3").unwrap_err();
        assert!(matches!(err, NodeError::FormulaSyntax(msg) if msg.contains("consecutive")));
    }

    #[test]
    fn rejects_leading_and_trailing_operators() {
        assert!(matches!(validate("* 2"), Err(NodeError::FormulaSyntax(_))));
        assert!(matches!(validate("/ 2"), Err(NodeError::FormulaSyntax(_))));
        assert!(matches!(validate("2 +"), Err(NodeError::FormulaSyntax(_))));
        assert!(validate("-2 * 3").is_ok());
    }

    #[test]
    fn rejects_unbalanced_parentheses() {
        assert!(matches!(validate("(1 + 2"), Err(NodeError::FormulaSyntax(_))));
        assert!(matches!(validate("1 + 2)"), Err(NodeError::FormulaSyntax(_))));
        assert!(matches!(validate(")1("), Err(NodeError::FormulaSyntax(_))));
    }

    #[test]
    fn evaluates_functions_and_variables() {
        let f = Formula::parse("round(sqrt(x) + max(a, b, 1), 2)").unwrap();
        let v = f
            .evaluate(&|name| match name {
                "x" => Some(2.0),
                "a" => Some(3.0),
                "b" => Some(-1.0),
                _ => None,
            })
            .unwrap();
        assert_eq!(v, 4.41);
        assert_eq!(f.variables(), vec!["x", "a", "b"]);
    }

    #[test]
    fn unknown_variable_and_division_by_zero_fail_evaluation() {
        assert!(matches!(eval_str("missing * 2"), Err(NodeError::FormulaEval(_))));
        assert!(matches!(eval_str("1 / 0"), Err(NodeError::FormulaEval(_))));
    }

    #[test]
    fn unknown_function_is_a_syntax_error() {
        assert!(matches!(Formula::parse("median(1, 2)"), Err(NodeError::FormulaSyntax(_))));
    }

    #[test]
    fn round_to_precision() {
        assert_eq!(round_to(2.34567, 2), 2.35);
        assert_eq!(round_to(-1.005, 0), -1.0);
    }
}
