use super::*;

/// ANSI "clear screen, cursor home".
const CLEAR_SCREEN: &[u8] = b"\x1b[2J\x1b[H";

/// What the executor does after a built-in ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Control {
    Continue,
    Exit,
}

/// Runs `builtin`, writing its output to `out`.
pub(crate) async fn run_builtin(
    builtin: Builtin,
    history: &HistoryStore,
    out: &mut BoxedWriter,
) -> Result<Control, ConnectError> {
    debug!("builtin {:?}", builtin);
    match builtin {
        Builtin::Exit => return Ok(Control::Exit),
        Builtin::Clear => out.write_all(CLEAR_SCREEN).await?,
        Builtin::History => {
            let mut text = String::new();
            for line in history.read_log()? {
                text.push_str(&line);
                text.push('\n');
            }
            out.write_all(text.as_bytes()).await?;
        }
        Builtin::OutList => {
            let mut text = String::new();
            for (sequence, command) in history.sequences()? {
                text.push_str(&format!("{sequence}  {command}\n"));
            }
            out.write_all(text.as_bytes()).await?;
        }
        Builtin::Out(requested) => {
            let text = replay(history, requested)?;
            out.write_all(text.as_bytes()).await?;
        }
    }
    out.flush().await?;
    Ok(Control::Continue)
}

/// Captured output of one sequence, host-prefixed when several hosts ran it.
fn replay(history: &HistoryStore, requested: Option<u64>) -> Result<String, ConnectError> {
    let sequence = match requested {
        Some(sequence) => sequence,
        None => match history.latest_sequence()? {
            Some(sequence) => sequence,
            None => return Ok("no recorded output\n".to_string()),
        },
    };
    let Some(results) = history.output(sequence)? else {
        return Ok(format!("no output recorded for sequence {sequence}\n"));
    };

    let tagged = results.len() > 1;
    let mut text = String::new();
    for (host, result) in &results {
        for line in result.output_lossy().lines() {
            if tagged {
                text.push_str(&format!("[{host}] "));
            }
            text.push_str(line);
            text.push('\n');
        }
    }
    Ok(text)
}
