use crate::error::MonitorError;

/// A compiled post-processing expression applied to captured stream values.
///
/// Grammar: numbers, the captured value as `X` (case-insensitive), unary
/// minus, `+ - * /` with the usual precedence, and parentheses. The default
/// fan-speed monitor uses `X/255*100` to turn a PWM duty byte into percent.
#[derive(Debug, Clone)]
pub struct Transform {
    expr: String,
    root: Node,
}

#[derive(Debug, Clone)]
enum Node {
    Num(f64),
    Var,
    Neg(Box<Node>),
    Add(Box<Node>, Box<Node>),
    Sub(Box<Node>, Box<Node>),
    Mul(Box<Node>, Box<Node>),
    Div(Box<Node>, Box<Node>),
}

impl Transform {
    pub fn parse(expr: &str) -> Result<Self, MonitorError> {
        let mut parser = Parser {
            chars: expr.chars().collect(),
            pos: 0,
        };
        let root = parser.expr().map_err(|reason| MonitorError::TransformFailed {
            expr: expr.to_string(),
            reason,
        })?;
        parser.skip_ws();
        if parser.pos != parser.chars.len() {
            return Err(MonitorError::TransformFailed {
                expr: expr.to_string(),
                reason: format!("unexpected input at position {}", parser.pos),
            });
        }
        Ok(Self {
            expr: expr.to_string(),
            root,
        })
    }

    pub fn expr(&self) -> &str {
        &self.expr
    }

    /// Evaluate with `x` bound to the captured value. Division is IEEE;
    /// callers treat a non-finite result as a transform failure.
    pub fn apply(&self, x: f64) -> f64 {
        eval(&self.root, x)
    }
}

fn eval(node: &Node, x: f64) -> f64 {
    match node {
        Node::Num(n) => *n,
        Node::Var => x,
        Node::Neg(a) => -eval(a, x),
        Node::Add(a, b) => eval(a, x) + eval(b, x),
        Node::Sub(a, b) => eval(a, x) - eval(b, x),
        Node::Mul(a, b) => eval(a, x) * eval(b, x),
        Node::Div(a, b) => eval(a, x) / eval(b, x),
    }
}

struct Parser {
    chars: Vec<char>,
    pos: usize,
}

impl Parser {
    fn skip_ws(&mut self) {
        while self.peek().is_some_and(|c| c.is_whitespace()) {
            self.pos += 1;
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn eat(&mut self, c: char) -> bool {
        self.skip_ws();
        if self.peek() == Some(c) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expr(&mut self) -> Result<Node, String> {
        let mut node = self.term()?;
        loop {
            if self.eat('+') {
                node = Node::Add(Box::new(node), Box::new(self.term()?));
            } else if self.eat('-') {
                node = Node::Sub(Box::new(node), Box::new(self.term()?));
            } else {
                return Ok(node);
            }
        }
    }

    fn term(&mut self) -> Result<Node, String> {
        let mut node = self.factor()?;
        loop {
            if self.eat('*') {
                node = Node::Mul(Box::new(node), Box::new(self.factor()?));
            } else if self.eat('/') {
                node = Node::Div(Box::new(node), Box::new(self.factor()?));
            } else {
                return Ok(node);
            }
        }
    }

    fn factor(&mut self) -> Result<Node, String> {
        self.skip_ws();
        if self.eat('-') {
            return Ok(Node::Neg(Box::new(self.factor()?)));
        }
        if self.eat('(') {
            let inner = self.expr()?;
            if !self.eat(')') {
                return Err("missing closing parenthesis".into());
            }
            return Ok(inner);
        }
        match self.peek() {
            Some('x') | Some('X') => {
                self.pos += 1;
                Ok(Node::Var)
            }
            Some(c) if c.is_ascii_digit() || c == '.' => self.number(),
            Some(c) => Err(format!("unexpected character {c:?}")),
            None => Err("unexpected end of expression".into()),
        }
    }

    fn number(&mut self) -> Result<Node, String> {
        let start = self.pos;
        while self.peek().is_some_and(|c| c.is_ascii_digit() || c == '.') {
            self.pos += 1;
        }
        let text: String = self.chars[start..self.pos].iter().collect();
        text.parse()
            .map(Node::Num)
            .map_err(|_| format!("bad number {text:?}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fan_pwm_to_percent() {
        let t = Transform::parse("X/255*100").unwrap();
        let v = t.apply(128.0);
        assert!((v - 50.196).abs() < 0.001, "got {v}");
        assert_eq!(t.apply(0.0), 0.0);
    }

    #[test]
    fn precedence_and_parens() {
        let t = Transform::parse("2+3*4").unwrap();
        assert_eq!(t.apply(0.0), 14.0);
        let t = Transform::parse("(2+3)*4").unwrap();
        assert_eq!(t.apply(0.0), 20.0);
        let t = Transform::parse("-X + 1.5").unwrap();
        assert_eq!(t.apply(2.0), -0.5);
    }

    #[test]
    fn lowercase_variable() {
        let t = Transform::parse("x*2").unwrap();
        assert_eq!(t.apply(3.0), 6.0);
    }

    #[test]
    fn division_is_ieee() {
        let t = Transform::parse("X/0").unwrap();
        assert!(!t.apply(1.0).is_finite());
    }

    #[test]
    fn rejects_garbage() {
        assert!(Transform::parse("").is_err());
        assert!(Transform::parse("X+").is_err());
        assert!(Transform::parse("foo(X)").is_err());
        assert!(Transform::parse("(X").is_err());
        assert!(Transform::parse("X 5").is_err());
    }
}
