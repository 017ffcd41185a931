use nix::unistd::Pid;
use std::collections::HashMap;
use thiserror::Error;

/// One fully reassembled trace event: a syscall return, a process exit or a
/// signal delivery.
#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub pid: Pid,
    /// seconds since the epoch, microsecond resolution
    pub ts: f64,
    pub event: Event,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Syscall {
        func: String,
        /// raw argument text, outer parentheses stripped
        args: String,
        retcode: RetCode,
        /// tracer annotations between the return value and the duration
        status: Option<String>,
        /// seconds spent in the call, 0.0 when the trace omitted it
        elapsed: f64,
    },
    Exit {
        code: i64,
    },
    /// Parsed but currently ignored downstream.
    Signal {
        signal: String,
        info: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum RetCode {
    Num(i64),
    /// symbolic return token, e.g. an address or "?"
    Sym(String),
}

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("malformed trace line: {0:?}")]
    Malformed(String),
    #[error("resumed call without a pending unfinished half: {0:?}")]
    UnmatchedResume(String),
    #[error("resumed call is {resumed:?} but the pending half is {pending:?}: {line:?}")]
    ResumeMismatch {
        resumed: String,
        pending: String,
        line: String,
    },
    #[error("unfinished call while another is pending on the same pid: {0:?}")]
    OverlappingUnfinished(String),
}

const UNFINISHED: &str = " <unfinished ...>";
const RESUMED: &str = "<... ";

/// Reassembles `Call`s from raw trace lines, pairing up calls that the tracer
/// split into an unfinished and a resumed half when processes ran
/// concurrently.
#[derive(Debug, Default)]
pub struct TraceParser {
    pending: HashMap<Pid, String>,
}

impl TraceParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse one line. Returns `Ok(None)` for the unfinished half of a split
    /// call; the matching resumed line later yields the whole `Call`.
    ///
    /// On `OverlappingUnfinished` the previously pending half is dropped and
    /// the new one kept, so a lenient caller can skip the error and carry on.
    pub fn parse_line(&mut self, line: &str) -> Result<Option<Call>, ParseError> {
        let malformed = || ParseError::Malformed(line.to_owned());

        let (pid, ts, rest) = split_head(line).ok_or_else(malformed)?;
        let pid = Pid::from_raw(pid.parse().map_err(|_| malformed())?);
        let ts: f64 = ts.parse().map_err(|_| malformed())?;

        if let Some(prefix) = rest.strip_suffix(UNFINISHED) {
            let prev = self.pending.insert(pid, prefix.to_owned());
            if prev.is_some() {
                return Err(ParseError::OverlappingUnfinished(line.to_owned()));
            }
            return Ok(None);
        }

        if let Some(rest) = rest.strip_prefix(RESUMED) {
            let (expected, rest) = rest.split_once(' ').ok_or_else(malformed)?;
            let rest = rest.strip_prefix("resumed>").ok_or_else(malformed)?;
            let prefix = self
                .pending
                .remove(&pid)
                .ok_or_else(|| ParseError::UnmatchedResume(line.to_owned()))?;
            let whole = format!("{}{}", prefix, rest.trim_start());
            let event = parse_call(&whole).ok_or_else(malformed)?;
            let func = match &event {
                Event::Syscall { func, .. } => func.as_str(),
                _ => "",
            };
            if func != expected {
                return Err(ParseError::ResumeMismatch {
                    resumed: expected.to_owned(),
                    pending: func.to_owned(),
                    line: line.to_owned(),
                });
            }
            return Ok(Some(Call { pid, ts, event }));
        }

        let event = parse_call(rest).ok_or_else(malformed)?;
        Ok(Some(Call { pid, ts, event }))
    }
}

/// Split `<pid> <ts> <rest>`, tolerating runs of whitespace between fields.
fn split_head(line: &str) -> Option<(&str, &str, &str)> {
    let line = line.trim();
    let (pid, rest) = line.split_once(|c: char| c.is_ascii_whitespace())?;
    let rest = rest.trim_start();
    let (ts, rest) = rest.split_once(|c: char| c.is_ascii_whitespace())?;
    Some((pid, ts, rest.trim_start()))
}

/// Parse the body of a line: either of the two synthetic forms (`+++ exited
/// with N +++`, `--- SIG... ---`) or a completed call
/// `name(args) = retval [status] [<elapsed>]`.
fn parse_call(call: &str) -> Option<Event> {
    if let Some(rest) = call.strip_prefix("+++ exited with ") {
        let code = rest.split_whitespace().next()?.parse().ok()?;
        return Some(Event::Exit { code });
    }
    if let Some(rest) = call.strip_prefix("--- ") {
        let (signal, rest) = rest.split_once(' ')?;
        let info = rest.strip_suffix(" ---")?;
        return Some(Event::Signal {
            signal: signal.to_owned(),
            info: info.to_owned(),
        });
    }

    let (call, rest) = call.rsplit_once(" = ")?;

    let (ret, rest) = match rest.split_once(' ') {
        Some((ret, rest)) => (ret, Some(rest)),
        None => (rest, None),
    };
    let retcode = match ret.parse() {
        Ok(n) => RetCode::Num(n),
        Err(_) => RetCode::Sym(ret.to_owned()),
    };

    // The duration is the final token, but only when it is angle-bracketed
    // seconds; everything before it is status text.
    let (status, elapsed) = match rest {
        None => (None, 0.0),
        Some(rest) => match rest.rsplit_once(' ') {
            Some((status, last)) => match parse_secs(last) {
                Some(secs) => (nonempty(status), secs),
                None => (nonempty(rest), 0.0),
            },
            None => match parse_secs(rest) {
                Some(secs) => (None, secs),
                None => (nonempty(rest), 0.0),
            },
        },
    };

    let open = call.find('(')?;
    let func = &call[..open];
    let body = &call[open + 1..];
    let args = body.rsplit_once(')').map_or(body, |(args, _)| args);

    Some(Event::Syscall {
        func: func.to_owned(),
        args: args.to_owned(),
        retcode,
        status,
        elapsed,
    })
}

fn parse_secs(token: &str) -> Option<f64> {
    token.strip_prefix('<')?.strip_suffix('>')?.parse().ok()
}

fn nonempty(s: &str) -> Option<String> {
    let s = s.trim();
    (!s.is_empty()).then(|| s.to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(parser: &mut TraceParser, line: &str) -> Call {
        parser.parse_line(line).unwrap().unwrap()
    }

    #[test]
    fn parses_complete_call() {
        let mut parser = TraceParser::new();
        let input = r##"16747 1628010654.112721 open("/dev/null", O_WRONLY|O_CREAT|O_TRUNC, 0666) = 3 <0.000030>"##;
        assert_eq!(
            call(&mut parser, input),
            Call {
                pid: Pid::from_raw(16747),
                ts: 1628010654.112721,
                event: Event::Syscall {
                    func: "open".to_owned(),
                    args: r##""/dev/null", O_WRONLY|O_CREAT|O_TRUNC, 0666"##.to_owned(),
                    retcode: RetCode::Num(3),
                    status: None,
                    elapsed: 0.000030,
                },
            }
        );
    }

    #[test]
    fn parses_error_status() {
        let mut parser = TraceParser::new();
        let input = r##"100 1.0 access("/etc/ld.so.nohwcap", F_OK) = -1 ENOENT (No such file or directory) <0.000010>"##;
        match call(&mut parser, input).event {
            Event::Syscall { retcode, status, elapsed, .. } => {
                assert_eq!(retcode, RetCode::Num(-1));
                assert_eq!(status.as_deref(), Some("ENOENT (No such file or directory)"));
                assert_eq!(elapsed, 0.000010);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn parses_missing_duration() {
        let mut parser = TraceParser::new();
        let input = r##"100 1.5 brk(NULL) = 0x137e000"##;
        match call(&mut parser, input).event {
            Event::Syscall { func, retcode, elapsed, .. } => {
                assert_eq!(func, "brk");
                assert_eq!(retcode, RetCode::Sym("0x137e000".to_owned()));
                assert_eq!(elapsed, 0.0);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn unbracketed_trailer_is_status() {
        let mut parser = TraceParser::new();
        let input = r##"100 1.5 exit_group(0) = ? <unavailable>"##;
        match call(&mut parser, input).event {
            Event::Syscall { retcode, status, elapsed, .. } => {
                assert_eq!(retcode, RetCode::Sym("?".to_owned()));
                assert_eq!(status.as_deref(), Some("<unavailable>"));
                assert_eq!(elapsed, 0.0);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn parses_exit_line() {
        let mut parser = TraceParser::new();
        let input = r##"100 1628010654.5 +++ exited with 7 +++"##;
        assert_eq!(
            call(&mut parser, input),
            Call {
                pid: Pid::from_raw(100),
                ts: 1628010654.5,
                event: Event::Exit { code: 7 },
            }
        );
    }

    #[test]
    fn parses_signal_line() {
        let mut parser = TraceParser::new();
        let input = r##"100 2.0 --- SIGCHLD {si_signo=SIGCHLD, si_code=CLD_EXITED, si_pid=200} ---"##;
        assert_eq!(
            call(&mut parser, input).event,
            Event::Signal {
                signal: "SIGCHLD".to_owned(),
                info: "{si_signo=SIGCHLD, si_code=CLD_EXITED, si_pid=200}".to_owned(),
            }
        );
    }

    #[test]
    fn reassembles_unfinished_resumed_pair() {
        let mut parser = TraceParser::new();
        let first = parser.parse_line(r##"100 1.0 read(3, <unfinished ...>"##).unwrap();
        assert_eq!(first, None);
        let second = call(&mut parser, r##"100 1.2 <... read resumed> "x", 1) = 1 <0.2>"##);
        assert_eq!(
            second,
            Call {
                pid: Pid::from_raw(100),
                ts: 1.2,
                event: Event::Syscall {
                    func: "read".to_owned(),
                    args: r##"3,"x", 1"##.to_owned(),
                    retcode: RetCode::Num(1),
                    status: None,
                    elapsed: 0.2,
                },
            }
        );
    }

    #[test]
    fn pending_halves_are_per_pid() {
        let mut parser = TraceParser::new();
        assert_eq!(parser.parse_line(r##"100 1.0 read(3, <unfinished ...>"##).unwrap(), None);
        assert_eq!(parser.parse_line(r##"200 1.1 wait4(-1, <unfinished ...>"##).unwrap(), None);
        let resumed = call(&mut parser, r##"200 1.2 <... wait4 resumed> [{WIFEXITED(s)}], 0, NULL) = 300 <0.1>"##);
        match resumed.event {
            Event::Syscall { func, retcode, .. } => {
                assert_eq!(func, "wait4");
                assert_eq!(retcode, RetCode::Num(300));
            }
            other => panic!("unexpected event {other:?}"),
        }
        let resumed = call(&mut parser, r##"100 1.3 <... read resumed> "", 16) = 0 <0.3>"##);
        assert_eq!(resumed.pid, Pid::from_raw(100));
    }

    #[test]
    fn resume_without_pending_is_an_error() {
        let mut parser = TraceParser::new();
        let err = parser
            .parse_line(r##"100 1.2 <... read resumed> "x", 1) = 1 <0.2>"##)
            .unwrap_err();
        assert!(matches!(err, ParseError::UnmatchedResume(_)));
    }

    #[test]
    fn resume_name_mismatch_is_an_error() {
        let mut parser = TraceParser::new();
        assert_eq!(parser.parse_line(r##"100 1.0 read(3, <unfinished ...>"##).unwrap(), None);
        let err = parser
            .parse_line(r##"100 1.2 <... write resumed> "x", 1) = 1 <0.2>"##)
            .unwrap_err();
        assert!(matches!(err, ParseError::ResumeMismatch { .. }));
    }

    #[test]
    fn overlapping_unfinished_keeps_inner_half() {
        let mut parser = TraceParser::new();
        assert_eq!(parser.parse_line(r##"100 1.0 read(3, <unfinished ...>"##).unwrap(), None);
        let err = parser
            .parse_line(r##"100 1.1 write(4, <unfinished ...>"##)
            .unwrap_err();
        assert!(matches!(err, ParseError::OverlappingUnfinished(_)));
        // the later (inner) half survives and can still be resumed
        let resumed = call(&mut parser, r##"100 1.2 <... write resumed> "y", 1) = 1 <0.1>"##);
        match resumed.event {
            Event::Syscall { func, .. } => assert_eq!(func, "write"),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn malformed_lines_are_errors() {
        let mut parser = TraceParser::new();
        for input in [
            "",
            "16747",
            "16747 1628010654.112721",
            r##"16aaa 1.0 open("/dev/null") = 3 <0.1>"##,
            r##"100 1.0 +++ killed by SIGKILL +++"##,
            r##"100 1.0 some text without an equals sign"##,
        ] {
            let err = parser.parse_line(input).unwrap_err();
            assert!(matches!(err, ParseError::Malformed(_)), "input {input:?}");
        }
    }

    #[test]
    fn args_keep_nested_parentheses() {
        let mut parser = TraceParser::new();
        let input = r##"100 1.0 wait4(-1, [{WIFEXITED(s) && WEXITSTATUS(s) == 0}], 0, NULL) = 200 <0.1>"##;
        match call(&mut parser, input).event {
            Event::Syscall { args, .. } => {
                assert_eq!(args, r##"-1, [{WIFEXITED(s) && WEXITSTATUS(s) == 0}], 0, NULL"##);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }
}
