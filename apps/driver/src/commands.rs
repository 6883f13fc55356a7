// apps/driver/src/commands.rs
use std::io::BufRead;
use std::str::FromStr;
use std::thread;

use crossbeam_channel::{unbounded, Receiver, Sender};
use rail_model::ControlMode;
use tracing::{debug, warn};

/// Discrete driver events, one per line on stdin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverInput {
    SetMode(ControlMode),
    LevelUp,
    LevelDown,
    ToggleAutopilot,
    Quit,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("unknown input {0:?} (traction|coast|brake|up|down|autopilot|quit, or q/w/e/o/p)")]
pub struct UnknownInput(pub String);

impl FromStr for DriverInput {
    type Err = UnknownInput;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let input = match s.trim().to_ascii_lowercase().as_str() {
            "q" | "traction" => DriverInput::SetMode(ControlMode::Traction),
            "w" | "coast" => DriverInput::SetMode(ControlMode::Coast),
            "e" | "brake" => DriverInput::SetMode(ControlMode::Brake),
            "o" | "up" | "+" => DriverInput::LevelUp,
            "p" | "down" | "-" => DriverInput::LevelDown,
            "a" | "autopilot" => DriverInput::ToggleAutopilot,
            "x" | "quit" | "exit" => DriverInput::Quit,
            other => return Err(UnknownInput(other.to_string())),
        };
        Ok(input)
    }
}

pub fn channel() -> (Sender<DriverInput>, Receiver<DriverInput>) {
    unbounded()
}

/// Parses lines from `reader` on a dedicated thread. The thread ends at EOF,
/// on `quit`, or once the session has dropped its receiver.
pub fn spawn_line_reader<R>(reader: R, tx: Sender<DriverInput>) -> thread::JoinHandle<()>
where
    R: BufRead + Send + 'static,
{
    thread::spawn(move || {
        for line in reader.lines() {
            let Ok(line) = line else { break };
            if line.trim().is_empty() {
                continue;
            }
            match line.parse::<DriverInput>() {
                Ok(input) => {
                    debug!(?input, "driver input");
                    if tx.send(input).is_err() || input == DriverInput::Quit {
                        break;
                    }
                }
                Err(e) => warn!("{e}"),
            }
        }
    })
}

pub fn spawn_stdin_reader(tx: Sender<DriverInput>) -> thread::JoinHandle<()> {
    spawn_line_reader(std::io::BufReader::new(std::io::stdin()), tx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn parses_words_and_keys() {
        assert_eq!("Q".parse(), Ok(DriverInput::SetMode(ControlMode::Traction)));
        assert_eq!(" coast ".parse(), Ok(DriverInput::SetMode(ControlMode::Coast)));
        assert_eq!("e".parse(), Ok(DriverInput::SetMode(ControlMode::Brake)));
        assert_eq!("o".parse(), Ok(DriverInput::LevelUp));
        assert_eq!("p".parse(), Ok(DriverInput::LevelDown));
        assert_eq!("autopilot".parse(), Ok(DriverInput::ToggleAutopilot));
        assert_eq!("quit".parse(), Ok(DriverInput::Quit));
        assert!("reverse".parse::<DriverInput>().is_err());
    }

    #[test]
    fn reader_forwards_in_order_and_stops_at_quit() {
        let (tx, rx) = channel();
        let script = "traction\n\no\nbogus\no\nquit\nbrake\n";
        spawn_line_reader(Cursor::new(script), tx).join().unwrap();
        let got: Vec<_> = rx.try_iter().collect();
        assert_eq!(
            got,
            vec![
                DriverInput::SetMode(ControlMode::Traction),
                DriverInput::LevelUp,
                DriverInput::LevelUp,
                DriverInput::Quit,
            ]
        );
    }
}
