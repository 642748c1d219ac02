// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Query grammar.
//!
//! A hand-written tokenizer and recursive-descent parser producing a typed
//! parse tree. Every node carries a grammar id; the walker turns the tree
//! into ordered enter/exit steps without looking at the raw text again.

use crate::error::{Result, TdbError};

/// Grammar ids. One per node kind the walker can visit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gid {
    Select,
    List,
    Count,
    Drop,
    Alter,
    Create,
    Grant,
    Revoke,
    Show,
    // select parts
    SelectAll,
    Aggregate,
    FnName,
    Interval,
    From,
    Between,
    After,
    Before,
    // series matching
    SeriesMatch,
    SeriesName,
    SeriesRegex,
    SeriesGroup,
    SetUnion,
    SetDifference,
    SetIntersection,
    // where expressions
    Where,
    ExprOr,
    ExprAnd,
    Condition,
    Prop,
    Operator,
    Operand,
    // misc clauses
    Limit,
    Columns,
    Column,
    Target,
    UserName,
    GroupName,
    Password,
    AccessList,
    AccessFlag,
    SetProp,
    BoolVal,
    TimeExpr,
    IgnoreThreshold,
    ShowField,
}

#[derive(Debug, Clone)]
pub struct Node {
    pub gid: Gid,
    pub text: String,
    pub children: Vec<Node>,
}

impl Node {
    fn new(gid: Gid, text: impl Into<String>) -> Node {
        Node {
            gid,
            text: text.into(),
            children: Vec::new(),
        }
    }

    fn with(gid: Gid, text: impl Into<String>, children: Vec<Node>) -> Node {
        Node {
            gid,
            text: text.into(),
            children,
        }
    }

    pub fn child(&self, gid: Gid) -> Option<&Node> {
        self.children.iter().find(|c| c.gid == gid)
    }

    pub fn children_of(&self, gid: Gid) -> impl Iterator<Item = &Node> {
        self.children.iter().filter(move |c| c.gid == gid)
    }
}

// ─────────────────────────────── tokens ─────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Word(String),
    Str(String),
    Regex(String),
    Group(String),
    Int(i64),
    Float(f64),
    Duration(String),
    Sym(char),
    Op(String),
}

fn tokenize(input: &str) -> Result<Vec<Tok>> {
    let mut toks = Vec::new();
    let chars: Vec<char> = input.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '"' | '\'' => {
                let quote = c;
                let start = i + 1;
                let mut j = start;
                while j < chars.len() && chars[j] != quote {
                    j += 1;
                }
                if j >= chars.len() {
                    return Err(err("unterminated string"));
                }
                toks.push(Tok::Str(chars[start..j].iter().collect()));
                i = j + 1;
            }
            '`' => {
                let start = i + 1;
                let mut j = start;
                while j < chars.len() && chars[j] != '`' {
                    j += 1;
                }
                if j >= chars.len() {
                    return Err(err("unterminated group name"));
                }
                toks.push(Tok::Group(chars[start..j].iter().collect()));
                i = j + 1;
            }
            '/' => {
                let start = i;
                let mut j = i + 1;
                while j < chars.len() && chars[j] != '/' {
                    if chars[j] == '\\' {
                        j += 1;
                    }
                    j += 1;
                }
                if j >= chars.len() {
                    return Err(err("unterminated regular expression"));
                }
                let mut end = j + 1;
                if end < chars.len() && chars[end] == 'i' {
                    end += 1;
                }
                toks.push(Tok::Regex(chars[start..end].iter().collect()));
                i = end;
            }
            '0'..='9' => {
                let start = i;
                let mut j = i;
                let mut is_float = false;
                while j < chars.len() && (chars[j].is_ascii_digit() || chars[j] == '.') {
                    if chars[j] == '.' {
                        is_float = true;
                    }
                    j += 1;
                }
                let num: String = chars[start..j].iter().collect();
                if !is_float && j < chars.len() && matches!(chars[j], 's' | 'm' | 'h' | 'd' | 'w')
                {
                    let after = chars.get(j + 1);
                    if after.map_or(true, |c| !c.is_alphanumeric() && *c != '_') {
                        toks.push(Tok::Duration(format!("{num}{}", chars[j])));
                        i = j + 1;
                        continue;
                    }
                }
                if is_float {
                    toks.push(Tok::Float(
                        num.parse().map_err(|_| err("invalid number"))?,
                    ));
                } else {
                    toks.push(Tok::Int(num.parse().map_err(|_| err("invalid number"))?));
                }
                i = j;
            }
            '=' | '!' | '<' | '>' | '~' => {
                let two: String = chars[i..chars.len().min(i + 2)].iter().collect();
                if ["==", "!=", "<=", ">=", "!~"].contains(&two.as_str()) {
                    toks.push(Tok::Op(two));
                    i += 2;
                } else if c == '<' || c == '>' || c == '~' {
                    toks.push(Tok::Op(c.to_string()));
                    i += 1;
                } else {
                    return Err(err(&format!("unexpected character '{c}'")));
                }
            }
            ',' | '&' | '|' | '^' | '-' | '+' | '(' | ')' | '{' | '}' | '*' => {
                toks.push(Tok::Sym(c));
                i += 1;
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                let mut j = i;
                while j < chars.len()
                    && (chars[j].is_ascii_alphanumeric() || chars[j] == '_' || chars[j] == '.')
                {
                    j += 1;
                }
                let word: String = chars[start..j].iter().collect();
                toks.push(Tok::Word(word.to_lowercase()));
                i = j;
            }
            _ => return Err(err(&format!("unexpected character '{c}'"))),
        }
    }
    Ok(toks)
}

fn err(msg: &str) -> TdbError {
    TdbError::Query(format!("query error: {msg}"))
}

// ─────────────────────────────── parser ─────────────────────────────────────

/// Max depth of curly-bracket nesting inside a where expression.
pub const MAX_EXPR_DEPTH: usize = 6;

struct Parser {
    toks: Vec<Tok>,
    pos: usize,
}

pub fn parse(input: &str) -> Result<Node> {
    let toks = tokenize(input)?;
    let mut p = Parser { toks, pos: 0 };
    let node = p.statement()?;
    if !p.at_end() {
        return Err(err("unexpected trailing input"));
    }
    Ok(node)
}

impl Parser {
    fn at_end(&self) -> bool {
        self.pos >= self.toks.len()
    }

    fn peek(&self) -> Option<&Tok> {
        self.toks.get(self.pos)
    }

    fn next(&mut self) -> Option<Tok> {
        let t = self.toks.get(self.pos).cloned();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn eat_word(&mut self, word: &str) -> bool {
        if matches!(self.peek(), Some(Tok::Word(w)) if w == word) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_word(&mut self, word: &str) -> Result<()> {
        if self.eat_word(word) {
            Ok(())
        } else {
            Err(err(&format!("expecting '{word}'")))
        }
    }

    fn eat_sym(&mut self, sym: char) -> bool {
        if matches!(self.peek(), Some(Tok::Sym(s)) if *s == sym) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_sym(&mut self, sym: char) -> Result<()> {
        if self.eat_sym(sym) {
            Ok(())
        } else {
            Err(err(&format!("expecting '{sym}'")))
        }
    }

    fn expect_str(&mut self) -> Result<String> {
        match self.next() {
            Some(Tok::Str(s)) => Ok(s),
            _ => Err(err("expecting a quoted string")),
        }
    }

    fn expect_ident(&mut self) -> Result<String> {
        match self.next() {
            Some(Tok::Word(w)) => Ok(w),
            _ => Err(err("expecting an identifier")),
        }
    }

    fn statement(&mut self) -> Result<Node> {
        match self.peek() {
            Some(Tok::Word(w)) => match w.as_str() {
                "select" => self.select_stmt(),
                "list" => self.list_stmt(),
                "count" => self.count_stmt(),
                "drop" => self.drop_stmt(),
                "alter" => self.alter_stmt(),
                "create" => self.create_stmt(),
                "grant" => self.grant_stmt(),
                "revoke" => self.revoke_stmt(),
                "show" => self.show_stmt(),
                other => Err(err(&format!("unrecognized statement '{other}'"))),
            },
            _ => Err(err("empty query")),
        }
    }

    // select * from "cpu" between 0 and 100 where length > 3
    fn select_stmt(&mut self) -> Result<Node> {
        self.expect_word("select")?;
        let mut children = Vec::new();
        if self.eat_sym('*') {
            children.push(Node::new(Gid::SelectAll, "*"));
        } else {
            children.push(self.aggregate()?);
        }
        self.expect_word("from")?;
        let mut from = vec![self.series_match()?];
        if let Some(n) = self.time_clause()? {
            from.push(n);
        }
        children.push(Node::with(Gid::From, "from", from));
        if let Some(w) = self.where_clause()? {
            children.push(w);
        }
        Ok(Node::with(Gid::Select, "select", children))
    }

    fn aggregate(&mut self) -> Result<Node> {
        let name = self.expect_ident()?;
        let mut children = vec![Node::new(Gid::FnName, &name)];
        self.expect_sym('(')?;
        if !self.eat_sym(')') {
            let interval = self.time_expr()?;
            children.push(Node::with(Gid::Interval, "", vec![interval]));
            self.expect_sym(')')?;
        }
        Ok(Node::with(Gid::Aggregate, name, children))
    }

    fn series_match(&mut self) -> Result<Node> {
        let mut terms = vec![self.series_term()?];
        loop {
            if self.eat_sym(',') {
                terms.push(Node::with(
                    Gid::SetUnion,
                    ",",
                    vec![self.series_term()?],
                ));
            } else if self.eat_sym('&') {
                terms.push(Node::with(
                    Gid::SetIntersection,
                    "&",
                    vec![self.series_term()?],
                ));
            } else if matches!(self.peek(), Some(Tok::Sym('-')))
                && self.peek_is_series_term(1)
            {
                self.pos += 1;
                terms.push(Node::with(
                    Gid::SetDifference,
                    "-",
                    vec![self.series_term()?],
                ));
            } else {
                break;
            }
        }
        Ok(Node::with(Gid::SeriesMatch, "", terms))
    }

    fn peek_is_series_term(&self, ahead: usize) -> bool {
        matches!(
            self.toks.get(self.pos + ahead),
            Some(Tok::Str(_)) | Some(Tok::Regex(_)) | Some(Tok::Group(_))
        )
    }

    fn series_term(&mut self) -> Result<Node> {
        match self.next() {
            Some(Tok::Str(s)) => Ok(Node::new(Gid::SeriesName, s)),
            Some(Tok::Regex(r)) => Ok(Node::new(Gid::SeriesRegex, r)),
            Some(Tok::Group(g)) => Ok(Node::new(Gid::SeriesGroup, g)),
            _ => Err(err("expecting a series name, regular expression or group")),
        }
    }

    fn time_clause(&mut self) -> Result<Option<Node>> {
        if self.eat_word("between") {
            let a = self.time_expr()?;
            self.expect_word("and")?;
            let b = self.time_expr()?;
            return Ok(Some(Node::with(Gid::Between, "between", vec![a, b])));
        }
        if self.eat_word("after") {
            let a = self.time_expr()?;
            return Ok(Some(Node::with(Gid::After, "after", vec![a])));
        }
        if self.eat_word("before") {
            let a = self.time_expr()?;
            return Ok(Some(Node::with(Gid::Before, "before", vec![a])));
        }
        Ok(None)
    }

    /// Integer literals, duration literals and `now`, combined with + and -.
    fn time_expr(&mut self) -> Result<Node> {
        let mut text = String::new();
        let mut expect_operand = true;
        loop {
            match self.peek() {
                Some(Tok::Int(v)) if expect_operand => {
                    text.push_str(&v.to_string());
                    expect_operand = false;
                    self.pos += 1;
                }
                Some(Tok::Duration(d)) if expect_operand => {
                    text.push_str(d);
                    expect_operand = false;
                    self.pos += 1;
                }
                Some(Tok::Word(w)) if expect_operand && w == "now" => {
                    text.push_str("now");
                    expect_operand = false;
                    self.pos += 1;
                }
                Some(Tok::Sym(s)) if !expect_operand && (*s == '+' || *s == '-') => {
                    text.push(*s);
                    expect_operand = true;
                    self.pos += 1;
                }
                _ => break,
            }
        }
        if text.is_empty() || expect_operand {
            return Err(err("expecting a timestamp expression"));
        }
        Ok(Node::new(Gid::TimeExpr, text))
    }

    fn where_clause(&mut self) -> Result<Option<Node>> {
        if !self.eat_word("where") {
            return Ok(None);
        }
        let expr = self.or_expr(0)?;
        Ok(Some(Node::with(Gid::Where, "where", vec![expr])))
    }

    fn or_expr(&mut self, depth: usize) -> Result<Node> {
        let mut terms = vec![self.and_expr(depth)?];
        while self.eat_word("or") {
            terms.push(self.and_expr(depth)?);
        }
        if terms.len() == 1 {
            Ok(terms.pop().unwrap())
        } else {
            Ok(Node::with(Gid::ExprOr, "or", terms))
        }
    }

    fn and_expr(&mut self, depth: usize) -> Result<Node> {
        let mut terms = vec![self.condition(depth)?];
        while self.eat_word("and") {
            terms.push(self.condition(depth)?);
        }
        if terms.len() == 1 {
            Ok(terms.pop().unwrap())
        } else {
            Ok(Node::with(Gid::ExprAnd, "and", terms))
        }
    }

    fn condition(&mut self, depth: usize) -> Result<Node> {
        if self.eat_sym('{') {
            if depth + 1 > MAX_EXPR_DEPTH {
                return Err(err("ambiguous option, expression nesting too deep"));
            }
            let inner = self.or_expr(depth + 1)?;
            self.expect_sym('}')?;
            return Ok(inner);
        }
        let prop = self.expect_ident()?;
        let op = match self.next() {
            Some(Tok::Op(op)) => op,
            _ => return Err(err("expecting a comparison operator")),
        };
        let operand = match self.peek() {
            Some(Tok::Float(v)) => {
                let v = *v;
                self.pos += 1;
                Node::new(Gid::Operand, v.to_string())
            }
            Some(Tok::Str(s)) => {
                let s = s.clone();
                self.pos += 1;
                Node::with(Gid::Operand, s, vec![Node::new(Gid::Column, "string")])
            }
            Some(Tok::Word(w)) if w != "now" => {
                let w = w.clone();
                self.pos += 1;
                Node::with(Gid::Operand, w, vec![Node::new(Gid::Column, "string")])
            }
            // Integers, durations and `now` arithmetic share the time
            // expression form.
            Some(Tok::Int(_)) | Some(Tok::Duration(_)) | Some(Tok::Word(_)) => {
                let expr = self.time_expr()?;
                Node::new(Gid::Operand, expr.text)
            }
            _ => return Err(err("expecting a comparison value")),
        };
        Ok(Node::with(
            Gid::Condition,
            "",
            vec![
                Node::new(Gid::Prop, prop),
                Node::new(Gid::Operator, op),
                operand,
            ],
        ))
    }

    fn list_stmt(&mut self) -> Result<Node> {
        self.expect_word("list")?;
        let target = self.expect_ident()?;
        let mut children = vec![Node::new(Gid::Target, &target)];

        // Optional column list.
        let mut cols = Vec::new();
        while let Some(Tok::Word(w)) = self.peek() {
            if ["where", "limit"].contains(&w.as_str()) {
                break;
            }
            cols.push(Node::new(Gid::Column, w.clone()));
            self.pos += 1;
            if !self.eat_sym(',') {
                break;
            }
        }
        if !cols.is_empty() {
            children.push(Node::with(Gid::Columns, "", cols));
        }
        if let Some(w) = self.where_clause()? {
            children.push(w);
        }
        if self.eat_word("limit") {
            match self.next() {
                Some(Tok::Int(n)) if n > 0 => {
                    children.push(Node::new(Gid::Limit, n.to_string()))
                }
                _ => return Err(err("expecting a positive limit")),
            }
        }
        Ok(Node::with(Gid::List, target, children))
    }

    fn count_stmt(&mut self) -> Result<Node> {
        self.expect_word("count")?;
        let target = self.expect_ident()?;
        let mut children = vec![Node::new(Gid::Target, &target)];
        if let Some(w) = self.where_clause()? {
            children.push(w);
        }
        Ok(Node::with(Gid::Count, target, children))
    }

    fn drop_stmt(&mut self) -> Result<Node> {
        self.expect_word("drop")?;
        match self.peek() {
            Some(Tok::Word(w)) if w == "user" => {
                self.pos += 1;
                let name = self.expect_str()?;
                Ok(Node::with(
                    Gid::Drop,
                    "user",
                    vec![Node::new(Gid::UserName, name)],
                ))
            }
            Some(Tok::Word(w)) if w == "group" => {
                self.pos += 1;
                let name = self.expect_str()?;
                Ok(Node::with(
                    Gid::Drop,
                    "group",
                    vec![Node::new(Gid::GroupName, name)],
                ))
            }
            Some(Tok::Word(w)) if w == "series" => {
                self.pos += 1;
                let mut children = vec![self.series_match()?];
                if let Some(w) = self.where_clause()? {
                    children.push(w);
                }
                if self.eat_word("set") {
                    self.expect_word("ignore_threshold")?;
                    let value = self.expect_ident()?;
                    children.push(Node::new(Gid::IgnoreThreshold, value));
                }
                Ok(Node::with(Gid::Drop, "series", children))
            }
            _ => Err(err("expecting 'series', 'user' or 'group'")),
        }
    }

    fn alter_stmt(&mut self) -> Result<Node> {
        self.expect_word("alter")?;
        match self.peek() {
            Some(Tok::Word(w)) if w == "user" => {
                self.pos += 1;
                let name = self.expect_str()?;
                self.expect_word("set")?;
                self.expect_word("password")?;
                let pw = self.expect_str()?;
                Ok(Node::with(
                    Gid::Alter,
                    "user",
                    vec![
                        Node::new(Gid::UserName, name),
                        Node::new(Gid::Password, pw),
                    ],
                ))
            }
            Some(Tok::Word(w)) if w == "database" => {
                self.pos += 1;
                self.expect_word("set")?;
                let prop = self.expect_ident()?;
                let value = match self.next() {
                    Some(Tok::Int(v)) => Node::new(Gid::Operand, v.to_string()),
                    Some(Tok::Float(v)) => Node::new(Gid::Operand, v.to_string()),
                    Some(Tok::Duration(d)) => Node::new(Gid::Operand, d),
                    _ => return Err(err("expecting a value")),
                };
                Ok(Node::with(
                    Gid::Alter,
                    "database",
                    vec![Node::new(Gid::SetProp, prop), value],
                ))
            }
            Some(Tok::Word(w)) if w == "server" => {
                self.pos += 1;
                self.expect_word("set")?;
                self.expect_word("backup_mode")?;
                let value = self.expect_ident()?;
                Ok(Node::with(
                    Gid::Alter,
                    "server",
                    vec![
                        Node::new(Gid::SetProp, "backup_mode"),
                        Node::new(Gid::BoolVal, value),
                    ],
                ))
            }
            _ => Err(err("expecting 'user', 'database' or 'server'")),
        }
    }

    fn create_stmt(&mut self) -> Result<Node> {
        self.expect_word("create")?;
        match self.peek() {
            Some(Tok::Word(w)) if w == "user" => {
                self.pos += 1;
                let name = self.expect_str()?;
                self.expect_word("set")?;
                self.expect_word("password")?;
                let pw = self.expect_str()?;
                Ok(Node::with(
                    Gid::Create,
                    "user",
                    vec![
                        Node::new(Gid::UserName, name),
                        Node::new(Gid::Password, pw),
                    ],
                ))
            }
            Some(Tok::Word(w)) if w == "group" => {
                self.pos += 1;
                let name = self.expect_str()?;
                self.expect_word("for")?;
                match self.next() {
                    Some(Tok::Regex(r)) => Ok(Node::with(
                        Gid::Create,
                        "group",
                        vec![
                            Node::new(Gid::GroupName, name),
                            Node::new(Gid::SeriesRegex, r),
                        ],
                    )),
                    _ => Err(err("expecting a regular expression")),
                }
            }
            _ => Err(err("expecting 'user' or 'group'")),
        }
    }

    fn access_list(&mut self) -> Result<Node> {
        let mut flags = vec![Node::new(Gid::AccessFlag, self.expect_ident()?)];
        loop {
            if self.eat_sym(',') || self.eat_word("and") {
                flags.push(Node::new(Gid::AccessFlag, self.expect_ident()?));
            } else {
                break;
            }
        }
        Ok(Node::with(Gid::AccessList, "", flags))
    }

    fn grant_stmt(&mut self) -> Result<Node> {
        self.expect_word("grant")?;
        let access = self.access_list()?;
        self.expect_word("to")?;
        self.eat_word("user");
        let name = self.expect_str()?;
        Ok(Node::with(
            Gid::Grant,
            "grant",
            vec![access, Node::new(Gid::UserName, name)],
        ))
    }

    fn revoke_stmt(&mut self) -> Result<Node> {
        self.expect_word("revoke")?;
        let access = self.access_list()?;
        self.expect_word("from")?;
        self.eat_word("user");
        let name = self.expect_str()?;
        Ok(Node::with(
            Gid::Revoke,
            "revoke",
            vec![access, Node::new(Gid::UserName, name)],
        ))
    }

    fn show_stmt(&mut self) -> Result<Node> {
        self.expect_word("show")?;
        let mut fields = Vec::new();
        while let Some(Tok::Word(w)) = self.peek() {
            fields.push(Node::new(Gid::ShowField, w.clone()));
            self.pos += 1;
            if !self.eat_sym(',') {
                break;
            }
        }
        Ok(Node::with(Gid::Show, "show", fields))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_select_star() {
        let node = parse("select * from \"cpu\"").unwrap();
        assert_eq!(node.gid, Gid::Select);
        assert!(node.child(Gid::SelectAll).is_some());
        let from = node.child(Gid::From).unwrap();
        let series = from.child(Gid::SeriesMatch).unwrap();
        assert_eq!(series.children[0].gid, Gid::SeriesName);
        assert_eq!(series.children[0].text, "cpu");
    }

    #[test]
    fn test_select_aggregate_between() {
        let node = parse("select mean(1h) from /^cpu/ between now - 1d and now").unwrap();
        let aggr = node.child(Gid::Aggregate).unwrap();
        assert_eq!(aggr.child(Gid::FnName).unwrap().text, "mean");
        let from = node.child(Gid::From).unwrap();
        let between = from.child(Gid::Between).unwrap();
        assert_eq!(between.children[0].text, "now-1d");
        assert_eq!(between.children[1].text, "now");
    }

    #[test]
    fn test_where_nesting_depth_limit() {
        let mut q = String::from("list series where ");
        for _ in 0..MAX_EXPR_DEPTH {
            q.push('{');
        }
        q.push_str("length > 1");
        for _ in 0..MAX_EXPR_DEPTH {
            q.push('}');
        }
        assert!(parse(&q).is_ok());

        let mut q = String::from("list series where ");
        for _ in 0..=MAX_EXPR_DEPTH {
            q.push('{');
        }
        q.push_str("length > 1");
        for _ in 0..=MAX_EXPR_DEPTH {
            q.push('}');
        }
        let e = parse(&q).unwrap_err();
        assert!(e.to_string().contains("ambiguous option"));
    }

    #[test]
    fn test_list_with_columns_and_limit() {
        let node = parse("list series name, length where length > 10 limit 50").unwrap();
        assert_eq!(node.child(Gid::Target).unwrap().text, "series");
        let cols: Vec<_> = node
            .child(Gid::Columns)
            .unwrap()
            .children_of(Gid::Column)
            .map(|c| c.text.clone())
            .collect();
        assert_eq!(cols, vec!["name", "length"]);
        assert_eq!(node.child(Gid::Limit).unwrap().text, "50");
        assert!(node.child(Gid::Where).is_some());
    }

    #[test]
    fn test_series_match_set_ops() {
        let node = parse("select * from \"a\", /b/ & `grp` - \"c\"").unwrap();
        let m = node
            .child(Gid::From)
            .unwrap()
            .child(Gid::SeriesMatch)
            .unwrap();
        assert_eq!(m.children.len(), 4);
        assert_eq!(m.children[1].gid, Gid::SetUnion);
        assert_eq!(m.children[2].gid, Gid::SetIntersection);
        assert_eq!(m.children[3].gid, Gid::SetDifference);
    }

    #[test]
    fn test_grant_revoke() {
        let node = parse("grant insert, select to user \"alice\"").unwrap();
        let flags: Vec<_> = node
            .child(Gid::AccessList)
            .unwrap()
            .children_of(Gid::AccessFlag)
            .map(|f| f.text.clone())
            .collect();
        assert_eq!(flags, vec!["insert", "select"]);
        assert_eq!(node.child(Gid::UserName).unwrap().text, "alice");

        let node = parse("revoke write from \"bob\"").unwrap();
        assert_eq!(node.gid, Gid::Revoke);
    }

    #[test]
    fn test_drop_series_with_threshold() {
        let node =
            parse("drop series /^old/ set ignore_threshold true").unwrap();
        assert_eq!(node.text, "series");
        assert_eq!(node.child(Gid::IgnoreThreshold).unwrap().text, "true");
    }

    #[test]
    fn test_show_fields() {
        let node = parse("show server, status").unwrap();
        assert_eq!(node.children.len(), 2);
        let node = parse("show").unwrap();
        assert!(node.children.is_empty());
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(parse("explode everything").is_err());
        assert!(parse("select from").is_err());
        assert!(parse("select * from").is_err());
        assert!(parse("").is_err());
    }
}
