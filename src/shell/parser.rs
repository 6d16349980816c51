//! Command line parsing.
//!
//! A line is split into statements at `;` and newlines, and each statement
//! into segments at `|`. Quoting follows POSIX shell rules closely enough to
//! find those operators; the segment text itself is kept verbatim so remote
//! shells see exactly what was typed.

use super::*;

/// Commands handled in-process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Builtin {
    /// `exit` / `quit`
    Exit,
    /// `clear`
    Clear,
    /// `%history`: the durable log
    History,
    /// `%outlist`: recorded sequence numbers
    OutList,
    /// `%out [N]`: captured output of sequence N, or of the latest one
    Out(Option<u64>),
}

impl Builtin {
    fn parse(tokens: &[String]) -> Result<Option<Self>, ParseError> {
        let Some(first) = tokens.first() else {
            return Ok(None);
        };
        let builtin = match first.as_str() {
            "exit" | "quit" => Builtin::Exit,
            "clear" => Builtin::Clear,
            "%history" => Builtin::History,
            "%outlist" => Builtin::OutList,
            "%out" => match &tokens[1..] {
                [] => Builtin::Out(None),
                [arg] => {
                    let seq = arg
                        .parse::<u64>()
                        .map_err(|_| ParseError::InvalidBuiltinArgument {
                            command: first.clone(),
                            argument: arg.clone(),
                        })?;
                    Builtin::Out(Some(seq))
                }
                [_, extra, ..] => {
                    return Err(ParseError::InvalidBuiltinArgument {
                        command: first.clone(),
                        argument: extra.clone(),
                    });
                }
            },
            _ => return Ok(None),
        };
        Ok(Some(builtin))
    }
}

/// Where a segment runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentKind {
    /// On every connected host.
    Remote,
    /// On the local machine, through `sh -c`.
    Local,
    Builtin(Builtin),
}

/// Operator following a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Pipe,
    Terminal,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub kind: SegmentKind,
    /// Words after quote removal.
    pub tokens: Vec<String>,
    /// Command text as typed, without the local prefix.
    pub text: String,
    pub operator: Operator,
}

/// Segments of one statement, joined by pipes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pipeline {
    pub segments: Vec<Segment>,
}

impl Pipeline {
    pub fn is_builtin_only(&self) -> bool {
        self.segments
            .iter()
            .all(|s| matches!(s.kind, SegmentKind::Builtin(_)))
    }
}

/// Segment under construction.
#[derive(Default)]
struct RawSegment {
    text: String,
    tokens: Vec<String>,
    word: Option<String>,
}

impl RawSegment {
    fn word(&mut self) -> &mut String {
        self.word.get_or_insert_with(String::new)
    }

    fn end_word(&mut self) {
        if let Some(word) = self.word.take() {
            self.tokens.push(word);
        }
    }

    /// Appends an operator that is kept verbatim, e.g. `&&`.
    fn fold_operator(&mut self, op: &str) {
        self.end_word();
        self.text.push_str(op);
        self.tokens.push(op.to_string());
    }
}

/// Lexer and classifier for shell lines.
#[derive(Debug, Clone)]
pub struct PipelineParser {
    local_prefix: char,
}

impl Default for PipelineParser {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_LOCAL_PREFIX)
    }
}

impl PipelineParser {
    pub fn new(local_prefix: char) -> Self {
        Self { local_prefix }
    }

    /// Parses `line` into statements. Empty statements are dropped.
    pub fn parse(&self, line: &str) -> Result<Vec<Pipeline>, ParseError> {
        let chars: Vec<(usize, char)> = line.char_indices().collect();
        let mut statements = Vec::new();
        let mut segments: Vec<(RawSegment, Operator)> = Vec::new();
        let mut current = RawSegment::default();
        let mut i = 0;

        while i < chars.len() {
            let (offset, c) = chars[i];
            match c {
                '\'' => {
                    let end = find_char(&chars, i + 1, '\'').ok_or(ParseError::UnterminatedQuote('\''))?;
                    let literal: String = chars[i + 1..end].iter().map(|(_, c)| c).collect();
                    current.word().push_str(&literal);
                    current.text.extend(chars[i..=end].iter().map(|(_, c)| c));
                    i = end + 1;
                }
                '"' => {
                    let mut j = i + 1;
                    let mut literal = String::new();
                    loop {
                        let Some(&(_, d)) = chars.get(j) else {
                            return Err(ParseError::UnterminatedQuote('"'));
                        };
                        match d {
                            '"' => break,
                            '\\' => {
                                let Some(&(_, next)) = chars.get(j + 1) else {
                                    return Err(ParseError::UnterminatedQuote('"'));
                                };
                                if !matches!(next, '"' | '\\' | '$' | '`' | '\n') {
                                    literal.push('\\');
                                }
                                literal.push(next);
                                j += 2;
                            }
                            '$' if chars.get(j + 1).map(|(_, c)| *c) == Some('(') => {
                                let end = find_substitution_end(&chars, j + 2)?;
                                literal.extend(chars[j..=end].iter().map(|(_, c)| c));
                                j = end + 1;
                            }
                            _ => {
                                literal.push(d);
                                j += 1;
                            }
                        }
                    }
                    current.word().push_str(&literal);
                    current.text.extend(chars[i..=j].iter().map(|(_, c)| c));
                    i = j + 1;
                }
                '\\' => {
                    let Some(&(_, next)) = chars.get(i + 1) else {
                        return Err(ParseError::TrailingEscape);
                    };
                    if next != '\n' {
                        current.word().push(next);
                    }
                    current.text.push('\\');
                    current.text.push(next);
                    i += 2;
                }
                '`' => {
                    let end = find_char(&chars, i + 1, '`').ok_or(ParseError::UnterminatedSubstitution)?;
                    let verbatim: String = chars[i..=end].iter().map(|(_, c)| c).collect();
                    current.word().push_str(&verbatim);
                    current.text.push_str(&verbatim);
                    i = end + 1;
                }
                '$' if chars.get(i + 1).map(|(_, c)| *c) == Some('(') => {
                    let end = find_substitution_end(&chars, i + 2)?;
                    let verbatim: String = chars[i..=end].iter().map(|(_, c)| c).collect();
                    current.word().push_str(&verbatim);
                    current.text.push_str(&verbatim);
                    i = end + 1;
                }
                '#' if current.word.is_none() => {
                    while i < chars.len() && chars[i].1 != '\n' {
                        i += 1;
                    }
                }
                '|' if chars.get(i + 1).map(|(_, c)| *c) == Some('|') => {
                    current.fold_operator("||");
                    i += 2;
                }
                '&' if chars.get(i + 1).map(|(_, c)| *c) == Some('&') => {
                    current.fold_operator("&&");
                    i += 2;
                }
                '&' => {
                    current.fold_operator("&");
                    i += 1;
                }
                '|' => {
                    current.end_word();
                    if current.tokens.is_empty() {
                        return Err(ParseError::EmptySegment(offset));
                    }
                    segments.push((std::mem::take(&mut current), Operator::Pipe));
                    i += 1;
                }
                ';' | '\n' => {
                    self.end_statement(&mut statements, &mut segments, &mut current, offset)?;
                    i += 1;
                }
                c if c.is_whitespace() => {
                    current.end_word();
                    current.text.push(c);
                    i += 1;
                }
                c => {
                    current.word().push(c);
                    current.text.push(c);
                    i += 1;
                }
            }
        }
        self.end_statement(&mut statements, &mut segments, &mut current, line.len())?;
        Ok(statements)
    }

    fn end_statement(
        &self,
        statements: &mut Vec<Pipeline>,
        segments: &mut Vec<(RawSegment, Operator)>,
        current: &mut RawSegment,
        offset: usize,
    ) -> Result<(), ParseError> {
        current.end_word();
        let last = std::mem::take(current);
        if last.tokens.is_empty() {
            if !segments.is_empty() {
                return Err(ParseError::EmptySegment(offset));
            }
            return Ok(());
        }
        segments.push((last, Operator::Terminal));

        let mut classified = Vec::with_capacity(segments.len());
        for (raw, operator) in segments.drain(..) {
            classified.push(self.classify(raw, operator)?);
        }
        statements.push(Pipeline {
            segments: merge_remote(classified),
        });
        Ok(())
    }

    fn classify(&self, raw: RawSegment, operator: Operator) -> Result<Segment, ParseError> {
        let text = raw.text.trim();
        if let Some(rest) = text.strip_prefix(self.local_prefix) {
            let mut tokens = raw.tokens;
            let first = tokens[0].strip_prefix(self.local_prefix).unwrap_or(&tokens[0]).to_string();
            if first.is_empty() {
                tokens.remove(0);
            } else {
                tokens[0] = first;
            }
            let rest = rest.trim_start();
            if tokens.is_empty() || rest.is_empty() {
                return Err(ParseError::EmptyLocalCommand);
            }
            return Ok(Segment {
                kind: SegmentKind::Local,
                tokens,
                text: rest.to_string(),
                operator,
            });
        }

        let kind = match Builtin::parse(&raw.tokens)? {
            Some(builtin) => SegmentKind::Builtin(builtin),
            None => SegmentKind::Remote,
        };
        Ok(Segment {
            kind,
            text: text.to_string(),
            tokens: raw.tokens,
            operator,
        })
    }
}

fn find_char(chars: &[(usize, char)], from: usize, target: char) -> Option<usize> {
    let mut j = from;
    while j < chars.len() {
        match chars[j].1 {
            '\\' if target == '`' => j += 2,
            c if c == target => return Some(j),
            _ => j += 1,
        }
    }
    None
}

/// Index of the `)` closing a `$(` whose body starts at `from`.
fn find_substitution_end(chars: &[(usize, char)], from: usize) -> Result<usize, ParseError> {
    let mut depth = 1usize;
    let mut j = from;
    while j < chars.len() {
        match chars[j].1 {
            '\\' => j += 1,
            '\'' => {
                j = find_char(chars, j + 1, '\'').ok_or(ParseError::UnterminatedSubstitution)?;
            }
            '`' => {
                j = find_char(chars, j + 1, '`').ok_or(ParseError::UnterminatedSubstitution)?;
            }
            '"' => j = find_double_quote_end(chars, j + 1)?,
            '$' if chars.get(j + 1).map(|(_, c)| *c) == Some('(') => {
                j = find_substitution_end(chars, j + 2)?;
            }
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth == 0 {
                    return Ok(j);
                }
            }
            _ => {}
        }
        j += 1;
    }
    Err(ParseError::UnterminatedSubstitution)
}

/// Index of the `"` closing a double-quoted string nested in a substitution.
fn find_double_quote_end(chars: &[(usize, char)], from: usize) -> Result<usize, ParseError> {
    let mut j = from;
    while j < chars.len() {
        match chars[j].1 {
            '"' => return Ok(j),
            '\\' => j += 1,
            '`' => {
                j = find_char(chars, j + 1, '`').ok_or(ParseError::UnterminatedSubstitution)?;
            }
            '$' if chars.get(j + 1).map(|(_, c)| *c) == Some('(') => {
                j = find_substitution_end(chars, j + 2)?;
            }
            _ => {}
        }
        j += 1;
    }
    Err(ParseError::UnterminatedSubstitution)
}

/// Collapses each run of adjacent remote segments into one.
fn merge_remote(segments: Vec<Segment>) -> Vec<Segment> {
    let mut merged: Vec<Segment> = Vec::with_capacity(segments.len());
    for segment in segments {
        if let Some(prev) = merged.last_mut()
            && prev.kind == SegmentKind::Remote
            && segment.kind == SegmentKind::Remote
            && prev.operator == Operator::Pipe
        {
            prev.text = format!("{} | {}", prev.text, segment.text);
            prev.tokens.push("|".to_string());
            prev.tokens.extend(segment.tokens);
            prev.operator = segment.operator;
            continue;
        }
        merged.push(segment);
    }
    merged
}
