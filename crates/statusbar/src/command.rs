use anyhow::{anyhow, bail, Result};

/// A command read from stdin while running.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Bind the player with the given bus name.
    Select(String),
    Deselect,
    /// Call a method on the bound player.
    Player(&'static str),
    /// Print a snapshot of every registry.
    State,
}

impl std::str::FromStr for Command {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut words = s.split_whitespace();
        let name = words.next().ok_or_else(|| anyhow!("Empty command"))?;
        let command = match name {
            "select" => Command::Select(words.next().ok_or_else(|| anyhow!("select needs the id of a player"))?.to_string()),
            "deselect" => Command::Deselect,
            "state" => Command::State,
            "play-pause" => Command::Player("PlayPause"),
            "play" => Command::Player("Play"),
            "pause" => Command::Player("Pause"),
            "next" => Command::Player("Next"),
            "previous" | "prev" => Command::Player("Previous"),
            "stop" => Command::Player("Stop"),
            other => bail!("Unknown command '{}'", other),
        };
        if let Some(extra) = words.next() {
            bail!("Unexpected argument '{}' to {}", extra, name);
        }
        Ok(command)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_commands() {
        let mpv = "org.mpris.MediaPlayer2.mpv";
        assert_eq!(format!("select {}", mpv).parse::<Command>().unwrap(), Command::Select(mpv.to_string()));
        assert_eq!("  play-pause ".parse::<Command>().unwrap(), Command::Player("PlayPause"));
        assert_eq!("prev".parse::<Command>().unwrap(), Command::Player("Previous"));
        assert_eq!("state".parse::<Command>().unwrap(), Command::State);
        assert!("select".parse::<Command>().is_err());
        assert!("deselect now".parse::<Command>().is_err());
        assert!("rewind".parse::<Command>().is_err());
        assert!("".parse::<Command>().is_err());
    }
}
