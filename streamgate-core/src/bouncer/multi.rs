//! Boolean combination of named sub-bouncers.
//!
//! The combination is an expression over sub-bouncer names using
//! `and`, `or`, `not` and parentheses, e.g.
//! `office-hours and (htpasswd or not blocklist)`. Evaluation is
//! short-circuited: a sub-bouncer on the dead side of a short circuit
//! is never invoked. Each evaluation keeps a per-request context so a
//! name appearing twice is asked only once.

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

use super::{AuthOutcome, Bouncer, KeycardRegistry};
use crate::keycard::Keycard;
use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Expr {
    Var(String),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
}

#[derive(Debug, PartialEq, Eq)]
enum Token {
    Ident(String),
    And,
    Or,
    Not,
    Open,
    Close,
}

fn lex(input: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();
    while let Some(&c) = chars.peek() {
        match c {
            '(' => {
                chars.next();
                tokens.push(Token::Open);
            }
            ')' => {
                chars.next();
                tokens.push(Token::Close);
            }
            c if c.is_whitespace() => {
                chars.next();
            }
            c if c.is_alphanumeric() || c == '_' || c == '-' => {
                let mut word = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_alphanumeric() || c == '_' || c == '-' {
                        word.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(match word.as_str() {
                    "and" => Token::And,
                    "or" => Token::Or,
                    "not" => Token::Not,
                    _ => Token::Ident(word),
                });
            }
            other => {
                return Err(Error::Config(format!(
                    "unexpected character '{other}' in combination"
                )))
            }
        }
    }
    Ok(tokens)
}

/// Recursive descent with precedence: or < and < not.
struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<&Token> {
        let index = self.pos;
        if index < self.tokens.len() {
            self.pos += 1;
        }
        self.tokens.get(index)
    }

    fn parse_or(&mut self) -> Result<Expr> {
        let mut left = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.next();
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr> {
        let mut left = self.parse_not()?;
        while self.peek() == Some(&Token::And) {
            self.next();
            let right = self.parse_not()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> Result<Expr> {
        if self.peek() == Some(&Token::Not) {
            self.next();
            let inner = self.parse_not()?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.parse_atom()
    }

    fn parse_atom(&mut self) -> Result<Expr> {
        match self.next() {
            Some(Token::Ident(name)) => Ok(Expr::Var(name.clone())),
            Some(Token::Open) => {
                let inner = self.parse_or()?;
                match self.next() {
                    Some(Token::Close) => Ok(inner),
                    _ => Err(Error::Config("missing ')' in combination".to_string())),
                }
            }
            other => Err(Error::Config(format!(
                "unexpected token {other:?} in combination"
            ))),
        }
    }
}

pub(crate) fn parse_combination(input: &str) -> Result<Expr> {
    let tokens = lex(input)?;
    if tokens.is_empty() {
        return Err(Error::Config("empty combination".to_string()));
    }
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.parse_or()?;
    if parser.pos != parser.tokens.len() {
        return Err(Error::Config("trailing input in combination".to_string()));
    }
    Ok(expr)
}

pub struct MultiBouncer {
    name: String,
    expr: Expr,
    bouncers: HashMap<String, Arc<dyn Bouncer>>,
    registry: KeycardRegistry,
}

impl MultiBouncer {
    pub fn new(
        name: &str,
        combination: &str,
        bouncers: HashMap<String, Arc<dyn Bouncer>>,
    ) -> Result<Self> {
        let expr = parse_combination(combination)?;
        let mut names = Vec::new();
        collect_vars(&expr, &mut names);
        for var in &names {
            if !bouncers.contains_key(var) {
                return Err(Error::Config(format!(
                    "combination references unknown bouncer '{var}'"
                )));
            }
        }
        debug!(name, combination, "multi bouncer ready");
        Ok(Self {
            name: name.to_string(),
            expr,
            bouncers,
            registry: KeycardRegistry::new(),
        })
    }

    fn eval<'a>(
        &'a self,
        expr: &'a Expr,
        keycard: &'a Keycard,
        context: &'a parking_lot::Mutex<HashMap<String, bool>>,
    ) -> BoxFuture<'a, bool> {
        async move {
            match expr {
                Expr::Var(bouncer_name) => {
                    if let Some(cached) = context.lock().get(bouncer_name).copied() {
                        return cached;
                    }
                    let result = match self.bouncers.get(bouncer_name) {
                        Some(bouncer) => {
                            let sub_card = keycard.clone();
                            matches!(
                                bouncer.authenticate(sub_card).await,
                                AuthOutcome::Accepted(_)
                            )
                        }
                        None => false,
                    };
                    context.lock().insert(bouncer_name.clone(), result);
                    result
                }
                Expr::Not(inner) => !self.eval(inner, keycard, context).await,
                Expr::And(left, right) => {
                    // Short circuit: the right side never runs on false.
                    self.eval(left, keycard, context).await
                        && self.eval(right, keycard, context).await
                }
                Expr::Or(left, right) => {
                    self.eval(left, keycard, context).await
                        || self.eval(right, keycard, context).await
                }
            }
        }
        .boxed()
    }
}

fn collect_vars(expr: &Expr, out: &mut Vec<String>) {
    match expr {
        Expr::Var(name) => out.push(name.clone()),
        Expr::Not(inner) => collect_vars(inner, out),
        Expr::And(a, b) | Expr::Or(a, b) => {
            collect_vars(a, out);
            collect_vars(b, out);
        }
    }
}

#[async_trait]
impl Bouncer for MultiBouncer {
    fn name(&self) -> &str {
        &self.name
    }

    fn registry(&self) -> &KeycardRegistry {
        &self.registry
    }

    async fn authenticate(&self, keycard: Keycard) -> AuthOutcome {
        let context = parking_lot::Mutex::new(HashMap::new());
        if self.eval(&self.expr, &keycard, &context).await {
            let mut keycard = keycard.authenticated();
            self.registry.add(&mut keycard);
            AuthOutcome::Accepted(keycard)
        } else {
            info!("combination refused keycard");
            AuthOutcome::Refused
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Sub-bouncer with a fixed verdict that counts invocations.
    struct FixedBouncer {
        name: String,
        verdict: bool,
        calls: AtomicUsize,
        registry: KeycardRegistry,
    }

    impl FixedBouncer {
        fn new(name: &str, verdict: bool) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                verdict,
                calls: AtomicUsize::new(0),
                registry: KeycardRegistry::new(),
            })
        }
    }

    #[async_trait]
    impl Bouncer for FixedBouncer {
        fn name(&self) -> &str {
            &self.name
        }

        fn registry(&self) -> &KeycardRegistry {
            &self.registry
        }

        async fn authenticate(&self, keycard: Keycard) -> AuthOutcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.verdict {
                AuthOutcome::Accepted(keycard.authenticated())
            } else {
                AuthOutcome::Refused
            }
        }
    }

    fn multi(
        combination: &str,
        subs: Vec<(&str, Arc<FixedBouncer>)>,
    ) -> (MultiBouncer, Vec<Arc<FixedBouncer>>) {
        let mut map: HashMap<String, Arc<dyn Bouncer>> = HashMap::new();
        let mut handles = Vec::new();
        for (name, bouncer) in subs {
            map.insert(name.to_string(), bouncer.clone());
            handles.push(bouncer);
        }
        (
            MultiBouncer::new("multi", combination, map).expect("combination parses"),
            handles,
        )
    }

    #[test]
    fn test_parse_precedence() {
        // a or b and c == a or (b and c)
        let expr = parse_combination("a or b and c").expect("parses");
        assert_eq!(
            expr,
            Expr::Or(
                Box::new(Expr::Var("a".into())),
                Box::new(Expr::And(
                    Box::new(Expr::Var("b".into())),
                    Box::new(Expr::Var("c".into()))
                ))
            )
        );
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_combination("").is_err());
        assert!(parse_combination("a and").is_err());
        assert!(parse_combination("(a or b").is_err());
        assert!(parse_combination("a ! b").is_err());
    }

    #[test]
    fn test_unknown_name_rejected() {
        let result = MultiBouncer::new("multi", "ghost", HashMap::new());
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_truth_table() {
        for (a, b, expected) in [
            (false, false, false),
            (false, true, true),
            (true, false, true),
            (true, true, false),
        ] {
            // xor spelled with and/or/not
            let (bouncer, _) = multi(
                "(a or b) and not (a and b)",
                vec![("a", FixedBouncer::new("a", a)), ("b", FixedBouncer::new("b", b))],
            );
            let outcome = bouncer.authenticate(Keycard::generic()).await;
            assert_eq!(
                matches!(outcome, AuthOutcome::Accepted(_)),
                expected,
                "a={a} b={b}"
            );
        }
    }

    #[tokio::test]
    async fn test_and_short_circuit_skips_right() {
        let a = FixedBouncer::new("a", false);
        let b = FixedBouncer::new("b", true);
        let (bouncer, _) = multi("a and b", vec![("a", a.clone()), ("b", b.clone())]);

        assert!(matches!(
            bouncer.authenticate(Keycard::generic()).await,
            AuthOutcome::Refused
        ));
        assert_eq!(a.calls.load(Ordering::SeqCst), 1);
        assert_eq!(b.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_or_short_circuit_skips_right() {
        let a = FixedBouncer::new("a", true);
        let b = FixedBouncer::new("b", true);
        let (bouncer, _) = multi("a or b", vec![("a", a.clone()), ("b", b.clone())]);

        assert!(matches!(
            bouncer.authenticate(Keycard::generic()).await,
            AuthOutcome::Accepted(_)
        ));
        assert_eq!(a.calls.load(Ordering::SeqCst), 1);
        assert_eq!(b.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_repeated_name_asked_once() {
        let a = FixedBouncer::new("a", true);
        let (bouncer, _) = multi("a and a", vec![("a", a.clone())]);

        assert!(matches!(
            bouncer.authenticate(Keycard::generic()).await,
            AuthOutcome::Accepted(_)
        ));
        assert_eq!(a.calls.load(Ordering::SeqCst), 1);
    }
}
