//! G-code line parsing for the planner's command surface.
//!
//! Handles the three command shapes the toolhead consumes: motion commands
//! (G0/G1), numbered commands (`G4 P500`, `M204 S3000`), and extended
//! commands (`SET_VELOCITY_LIMIT VELOCITY=250`). Anything else still parses
//! into its raw shape so the dispatcher can skip it.

use std::io::{self, BufRead};

use thiserror::Error;

#[derive(Debug, PartialEq, Clone)]
pub enum GCodeOp {
    Nop,
    Move {
        x: Option<f64>,
        y: Option<f64>,
        z: Option<f64>,
        e: Option<f64>,
        f: Option<f64>,
    },
    Numbered {
        letter: char,
        code: u16,
        params: NumberedParams,
    },
    Extended {
        command: String,
        params: ExtendedParams,
    },
}

impl GCodeOp {
    pub fn is_nop(&self) -> bool {
        matches!(self, GCodeOp::Nop)
    }
}

/// `X10 Y2.5`-style parameters, in input order.
#[derive(Debug, PartialEq, Clone, Default)]
pub struct NumberedParams(Vec<(char, String)>);

impl NumberedParams {
    pub fn from_vec(params: Vec<(char, String)>) -> Self {
        NumberedParams(params)
    }

    pub fn get_str(&self, key: char) -> Option<&str> {
        self.0
            .iter()
            .find(|(c, _)| *c == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn get_number<T: lexical_core::FromLexical>(&self, key: char) -> Option<T> {
        self.get_str(key)
            .and_then(|v| lexical_core::parse(v.as_bytes()).ok())
    }
}

/// `KEY=VALUE`-style parameters of extended commands, in input order, with
/// keys lowercased.
#[derive(Debug, PartialEq, Clone, Default)]
pub struct ExtendedParams(Vec<(String, String)>);

impl ExtendedParams {
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn get_number<T: lexical_core::FromLexical>(&self, key: &str) -> Option<T> {
        self.get_str(key)
            .and_then(|v| lexical_core::parse(v.as_bytes()).ok())
    }
}

#[derive(Debug, PartialEq, Clone)]
pub struct GCodeCommand {
    pub op: GCodeOp,
    pub comment: Option<String>,
}

#[derive(Debug, Error)]
#[error("gcode parse error at: {position}")]
pub struct GCodeParseError {
    position: String,
}

#[derive(Error, Debug)]
pub enum GCodeReadError {
    #[error("IO error")]
    Io(#[from] io::Error),
    #[error("invalid gcode")]
    Parse(#[from] GCodeParseError),
}

/// Line-by-line command reader over any buffered input.
pub struct GCodeReader<R: BufRead> {
    rdr: R,
    buf: String,
}

impl<R: BufRead> GCodeReader<R> {
    pub fn new(rdr: R) -> GCodeReader<R> {
        GCodeReader {
            rdr,
            buf: String::new(),
        }
    }
}

impl<R: BufRead> Iterator for GCodeReader<R> {
    type Item = Result<GCodeCommand, GCodeReadError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.buf.clear();
        match self.rdr.read_line(&mut self.buf) {
            Ok(0) => None,
            Ok(_) => Some(parse_gcode(&self.buf).map_err(|e| e.into())),
            Err(e) => Some(Err(GCodeReadError::Io(e))),
        }
    }
}

pub fn parse_gcode(line: &str) -> Result<GCodeCommand, GCodeParseError> {
    match parser::command(line.trim()) {
        Ok((_, cmd)) => Ok(cmd),
        Err(nom::Err::Incomplete(_)) => Err(GCodeParseError {
            position: String::new(),
        }),
        Err(nom::Err::Error(e)) | Err(nom::Err::Failure(e)) => Err(GCodeParseError {
            position: e.input.to_string(),
        }),
    }
}

mod parser {
    use super::*;
    use nom::{
        branch::alt,
        bytes::complete::{tag, take_till, take_while},
        character::complete::{satisfy, space0, space1},
        combinator::{complete, eof, map, opt, recognize},
        error::{Error, ErrorKind, ParseError},
        multi::separated_list0,
        sequence::pair,
        Err, IResult, Parser, Slice,
    };

    pub(super) fn command(s: &str) -> IResult<&str, GCodeCommand> {
        let (s, _) = space0(s)?;
        let (s, _line_no) = opt(line_number)(s)?;
        let (s, (op, comment)) = alt((
            complete(numbered_command),
            complete(extended_command),
            complete(map(comment, |c| (GCodeOp::Nop, Some(c)))),
            complete(eof.map(|_| (GCodeOp::Nop, None))),
        ))(s)?;
        Ok((
            s,
            GCodeCommand {
                op,
                comment: comment.map(str::to_string),
            },
        ))
    }

    fn skip_space(s: &str) -> IResult<&str, ()> {
        if s.is_empty() {
            Ok(("", ()))
        } else {
            space0(s).map(|(s, _)| (s, ()))
        }
    }

    fn line_number(s: &str) -> IResult<&str, u64> {
        let (s, _) = alt((tag("N"), tag("n")))(s)?;
        let (s, v) = match lexical_core::parse_partial::<u64>(s.as_bytes()) {
            Ok((value, used)) => (s.slice(used..), value),
            Err(_) => return Err(Err::Error(Error::from_error_kind(s, ErrorKind::Digit))),
        };
        let (s, _) = skip_space(s)?;
        Ok((s, v))
    }

    fn numbered_command(s: &str) -> IResult<&str, (GCodeOp, Option<&str>)> {
        let (s, letter) = satisfy(|c| c.is_ascii_alphabetic())(s)?;
        let (s, code) = match lexical_core::parse_partial::<u16>(s.as_bytes()) {
            Ok((_, 0)) => return Err(Err::Error(Error::from_error_kind(s, ErrorKind::Digit))),
            Ok((value, used)) => (s.slice(used..), value),
            Err(_) => return Err(Err::Error(Error::from_error_kind(s, ErrorKind::Digit))),
        };
        let (s, _) = skip_space(s)?;
        let (s, params) = separated_list0(space1, numbered_param)(s)?;
        let (s, comment) = opt(comment)(s)?;
        let letter = letter.to_ascii_uppercase();
        Ok((s, (assemble_numbered(letter, code, params), comment)))
    }

    fn numbered_param(s: &str) -> IResult<&str, (char, &str)> {
        let (s, letter) = satisfy(|c| c.is_ascii_alphabetic())(s)?;
        let (s, value) = take_till(|c: char| c.is_whitespace() || c == ';')(s)?;
        Ok((s, (letter.to_ascii_uppercase(), value)))
    }

    fn assemble_numbered(letter: char, code: u16, params: Vec<(char, &str)>) -> GCodeOp {
        if letter == 'G' && (code == 0 || code == 1) {
            let mut x = None;
            let mut y = None;
            let mut z = None;
            let mut e = None;
            let mut f = None;
            for (key, value) in params {
                let value = match lexical_core::parse::<f64>(value.as_bytes()) {
                    Ok(v) => v,
                    Err(_) => continue,
                };
                match key {
                    'X' => x = Some(value),
                    'Y' => y = Some(value),
                    'Z' => z = Some(value),
                    'E' => e = Some(value),
                    'F' => f = Some(value),
                    _ => {}
                }
            }
            return GCodeOp::Move { x, y, z, e, f };
        }
        GCodeOp::Numbered {
            letter,
            code,
            params: NumberedParams::from_vec(
                params
                    .into_iter()
                    .map(|(k, v)| (k, v.to_string()))
                    .collect(),
            ),
        }
    }

    fn extended_command(s: &str) -> IResult<&str, (GCodeOp, Option<&str>)> {
        let (s, name) = extended_name(s)?;
        let (s, _) = skip_space(s)?;
        let (s, params) = separated_list0(space1, extended_param)(s)?;
        let (s, comment) = opt(comment)(s)?;
        Ok((
            s,
            (
                GCodeOp::Extended {
                    command: name.to_lowercase(),
                    params: ExtendedParams(
                        params
                            .into_iter()
                            .map(|(k, v)| (k.to_lowercase(), v.to_string()))
                            .collect(),
                    ),
                },
                comment,
            ),
        ))
    }

    fn extended_name(s: &str) -> IResult<&str, &str> {
        recognize(pair(
            satisfy(|c| c.is_ascii_alphabetic()),
            take_while(|c: char| c.is_alphanumeric() || c == '_'),
        ))(s)
    }

    fn extended_param(s: &str) -> IResult<&str, (&str, &str)> {
        let (s, key) = take_till(|c: char| c.is_whitespace() || c == '=' || c == ';')(s)?;
        let (s, _) = tag("=")(s)?;
        let (s, value) = take_till(|c: char| c.is_whitespace() || c == ';')(s)?;
        Ok((s, (key, value)))
    }

    fn comment(s: &str) -> IResult<&str, &str> {
        let (s, _) = space0(s)?;
        let (s, _) = tag(";")(s)?;
        Ok(("", s.trim_end()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_moves() {
        let cmd = parse_gcode("G1 X10 Y-2.5 E0.04 F3000").unwrap();
        assert_eq!(
            cmd.op,
            GCodeOp::Move {
                x: Some(10.0),
                y: Some(-2.5),
                z: None,
                e: Some(0.04),
                f: Some(3000.0),
            }
        );
    }

    #[test]
    fn parses_numbered_with_params() {
        let cmd = parse_gcode("M204 S3000").unwrap();
        match cmd.op {
            GCodeOp::Numbered {
                letter,
                code,
                params,
            } => {
                assert_eq!((letter, code), ('M', 204));
                assert_eq!(params.get_number::<f64>('S'), Some(3000.0));
            }
            op => panic!("unexpected op {:?}", op),
        }
    }

    #[test]
    fn parses_extended_commands() {
        let cmd = parse_gcode("SET_VELOCITY_LIMIT VELOCITY=250 ACCEL=4000").unwrap();
        match cmd.op {
            GCodeOp::Extended { command, params } => {
                assert_eq!(command, "set_velocity_limit");
                assert_eq!(params.get_number::<f64>("velocity"), Some(250.0));
                assert_eq!(params.get_number::<f64>("accel"), Some(4000.0));
            }
            op => panic!("unexpected op {:?}", op),
        }
    }

    #[test]
    fn parses_comments_and_blank_lines() {
        let cmd = parse_gcode("; just a comment").unwrap();
        assert!(cmd.op.is_nop());
        assert_eq!(cmd.comment.as_deref(), Some(" just a comment"));
        assert!(parse_gcode("").unwrap().op.is_nop());
        let cmd = parse_gcode("G1 X5 ; trailing").unwrap();
        assert!(matches!(cmd.op, GCodeOp::Move { x: Some(x), .. } if x == 5.0));
        assert_eq!(cmd.comment.as_deref(), Some(" trailing"));
    }

    #[test]
    fn parses_line_numbers() {
        let cmd = parse_gcode("N42 G1 X1").unwrap();
        assert!(matches!(cmd.op, GCodeOp::Move { x: Some(x), .. } if x == 1.0));
    }

    #[test]
    fn reader_iterates_lines() {
        let src = "G1 X1\nG4 P250\n";
        let cmds: Vec<_> = GCodeReader::new(src.as_bytes())
            .map(|c| c.unwrap())
            .collect();
        assert_eq!(cmds.len(), 2);
        assert!(matches!(cmds[0].op, GCodeOp::Move { .. }));
        assert!(matches!(cmds[1].op, GCodeOp::Numbered { code: 4, .. }));
    }
}
