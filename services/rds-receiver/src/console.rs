//! Line-oriented operator console: one command per line on stdin, one reply
//! per command on the log.

use std::path::PathBuf;
use std::str::FromStr;

use tokio::io::AsyncWriteExt;
use tokio_stream::StreamExt;
use tracing::{info, warn};

use crate::controller::{AudioStream, ReceiverController};
use crate::device::{Gain, ReceiverMode};
use crate::error::Result;

pub const HELP: &str = "commands: status | start | stop | tune <MHz> [gain] | seek | search \
                        | mode <fm|dab> | channel <name> | service <sid> | audio <file|off> | quit";

#[derive(Debug, Clone, PartialEq)]
pub enum ConsoleCommand {
    Status,
    Start,
    Stop,
    Tune {
        frequency_mhz: f64,
        gain: Option<Gain>,
    },
    Seek,
    Search,
    Mode(ReceiverMode),
    Channel(String),
    Service(String),
    /// Record the live audio stream to a file
    AudioTo(PathBuf),
    AudioOff,
    Help,
    Quit,
}

impl FromStr for ConsoleCommand {
    type Err = String;

    fn from_str(line: &str) -> std::result::Result<Self, Self::Err> {
        let mut words = line.split_whitespace();
        let verb = words.next().unwrap_or("").to_ascii_lowercase();
        let arg = words.next();
        let extra = words.next();

        let required = |what: &str| arg.ok_or_else(|| format!("`{}` needs {}", verb, what));

        let command = match verb.as_str() {
            "status" | "" => Self::Status,
            "start" => Self::Start,
            "stop" => Self::Stop,
            "tune" => {
                let text = required("a frequency in MHz")?;
                let frequency_mhz = text
                    .trim_end_matches(['M', 'm'])
                    .parse::<f64>()
                    .map_err(|_| format!("invalid frequency `{}`", text))?;
                let gain = extra.map(str::parse::<Gain>).transpose()?;
                return Ok(Self::Tune { frequency_mhz, gain });
            }
            "seek" | "next" => Self::Seek,
            "search" | "scan" => Self::Search,
            "mode" => Self::Mode(required("fm or dab")?.parse()?),
            "fm" => Self::Mode(ReceiverMode::Fm),
            "dab" => Self::Mode(ReceiverMode::DigitalBroadcast),
            "channel" => Self::Channel(required("a channel name")?.to_string()),
            "service" => Self::Service(required("a service id")?.to_string()),
            "audio" => match required("a file or `off`")? {
                off if off.eq_ignore_ascii_case("off") => Self::AudioOff,
                path => Self::AudioTo(PathBuf::from(path)),
            },
            "help" | "?" => Self::Help,
            "quit" | "exit" => Self::Quit,
            other => return Err(format!("unknown command `{}`", other)),
        };
        if extra.is_some() {
            return Err(format!("too many arguments for `{}`", verb));
        }
        Ok(command)
    }
}

/// Run one console command and describe the outcome
pub async fn execute(controller: &ReceiverController, command: ConsoleCommand) -> Result<String> {
    let reply = match command {
        ConsoleCommand::Status => {
            let status = controller.status();
            let mut line = format!(
                "{}{} {:.1} MHz running={} searching={} audio={} search={:?} ({}/{})",
                status.mode.target(),
                if status.mode.is_pending() { " (pending)" } else { "" },
                status.tuning.frequency_mhz,
                status.running,
                status.searching,
                status.audio_active,
                status.search.status,
                status.search.progress_index,
                status.search.total_candidates,
            );
            if let Some(dab) = &status.digital {
                line.push_str(&format!(
                    " channel={} services={} service={}",
                    dab.channel,
                    dab.services.len(),
                    dab.service.as_deref().unwrap_or("-")
                ));
            }
            if let Some(err) = &status.last_error {
                line.push_str(&format!(" last_error=\"{}\"", err));
            }
            line
        }
        ConsoleCommand::Start => {
            controller.start().await?;
            "receiver started".to_string()
        }
        ConsoleCommand::Stop => {
            controller.stop().await?;
            "receiver stopped".to_string()
        }
        ConsoleCommand::Tune { frequency_mhz, gain } => {
            let tuning = controller.tune(frequency_mhz, gain).await?;
            format!("tuned to {:.1} MHz (gain {})", tuning.frequency_mhz, tuning.gain)
        }
        ConsoleCommand::Seek => {
            let tuning = controller.seek_next().await?;
            format!("tuned to {:.1} MHz", tuning.frequency_mhz)
        }
        ConsoleCommand::Search => {
            let status = controller.toggle_search().await?;
            format!("search {:?}", status)
        }
        ConsoleCommand::Mode(mode) => {
            controller.switch_mode(mode).await?;
            format!("{} mode active", mode)
        }
        ConsoleCommand::Channel(channel) => {
            let dab = controller.tune_digital(&channel).await?;
            format!("DAB channel {} ({} kHz)", dab.channel, dab.frequency_khz)
        }
        ConsoleCommand::Service(sid) => {
            let dab = controller.tune_service(&sid).await?;
            format!("DAB service {} at {}", sid, dab.audio_url)
        }
        ConsoleCommand::AudioTo(path) => {
            let stream = controller.start_audio().await?;
            tokio::spawn(record(stream, path.clone()));
            format!("recording audio to {}", path.display())
        }
        ConsoleCommand::AudioOff => {
            controller.stop_audio().await?;
            "audio stopped".to_string()
        }
        ConsoleCommand::Help => HELP.to_string(),
        ConsoleCommand::Quit => "bye".to_string(),
    };
    Ok(reply)
}

/// Copy an audio stream to `path` until the stream ends
async fn record(mut stream: AudioStream, path: PathBuf) {
    let mut file = match tokio::fs::File::create(&path).await {
        Ok(file) => file,
        Err(e) => {
            warn!("[Console] Cannot create {}: {}", path.display(), e);
            return;
        }
    };
    let mut written = 0usize;
    while let Some(chunk) = stream.next().await {
        if let Err(e) = file.write_all(&chunk).await {
            warn!("[Console] Writing {} failed: {}", path.display(), e);
            return;
        }
        written += chunk.len();
    }
    let _ = file.flush().await;
    info!("[Console] Audio recording closed ({} bytes)", written);
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use crate::sink::SinkDispatcher;
    use crate::testing::{test_config, CollectingSink, ScriptedProvider};

    #[test]
    fn test_parse_commands() {
        assert_eq!("".parse(), Ok(ConsoleCommand::Status));
        assert_eq!(
            "tune 101.7".parse(),
            Ok(ConsoleCommand::Tune {
                frequency_mhz: 101.7,
                gain: None
            })
        );
        assert_eq!(
            "TUNE 99.1M 32.8".parse(),
            Ok(ConsoleCommand::Tune {
                frequency_mhz: 99.1,
                gain: Some(Gain::Db(32.8))
            })
        );
        assert_eq!("dab".parse(), Ok(ConsoleCommand::Mode(ReceiverMode::DigitalBroadcast)));
        assert_eq!("mode fm".parse(), Ok(ConsoleCommand::Mode(ReceiverMode::Fm)));
        assert_eq!("service 0x4e33".parse(), Ok(ConsoleCommand::Service("0x4e33".into())));
        assert_eq!("audio OFF".parse(), Ok(ConsoleCommand::AudioOff));
        assert_eq!(
            "audio /tmp/out.mp3".parse(),
            Ok(ConsoleCommand::AudioTo(PathBuf::from("/tmp/out.mp3")))
        );
    }

    #[test]
    fn test_parse_errors() {
        assert!("tune".parse::<ConsoleCommand>().is_err());
        assert!("tune fast".parse::<ConsoleCommand>().is_err());
        assert!("tune 100 loud".parse::<ConsoleCommand>().is_err());
        assert!("mode am".parse::<ConsoleCommand>().is_err());
        assert!("seek now".parse::<ConsoleCommand>().is_err());
        assert!("reboot".parse::<ConsoleCommand>().is_err());
    }

    #[tokio::test]
    async fn test_execute_drives_controller() {
        let provider = ScriptedProvider::new();
        let sink = SinkDispatcher::start(vec![Box::new(CollectingSink::new())], 16).unwrap();
        let controller =
            ReceiverController::spawn(Arc::new(test_config()), Arc::new(provider.clone()), sink);

        execute(&controller, ConsoleCommand::Start).await.unwrap();
        let reply = execute(
            &controller,
            ConsoleCommand::Tune {
                frequency_mhz: 95.0,
                gain: None,
            },
        )
        .await
        .unwrap();
        assert!(reply.contains("95.0 MHz"));

        let reply = execute(&controller, ConsoleCommand::Seek).await.unwrap();
        assert!(reply.contains("95.1 MHz"));
        assert_eq!(controller.status().tuning.frequency_mhz, 95.1);

        // FM only
        assert!(execute(&controller, ConsoleCommand::Service("0x4e33".into()))
            .await
            .is_err());

        let path = std::env::temp_dir().join(format!("rds-console-{}.raw", std::process::id()));
        execute(&controller, ConsoleCommand::AudioTo(path.clone()))
            .await
            .unwrap();
        assert!(controller.status().audio_active);
        tokio::time::sleep(Duration::from_millis(300)).await;
        execute(&controller, ConsoleCommand::AudioOff).await.unwrap();
        assert!(!controller.status().audio_active);

        let status = execute(&controller, ConsoleCommand::Status).await.unwrap();
        assert!(status.starts_with("FM 95.1 MHz running=true"));

        execute(&controller, ConsoleCommand::Stop).await.unwrap();
        assert!(!controller.status().running);
        controller.shutdown().await.unwrap();
        let _ = std::fs::remove_file(path);
    }
}
