//! Command lines for the external radio tools

use crate::config::Config;
use crate::device::{Gain, Tuning};
use crate::process::{CommandSpec, PipelineSpec};

/// MPX sample rate redsea expects from rtl_fm
const MPX_RATE: &str = "171k";
const AUDIO_RATE: &str = "44100";

/// Frequency in rtl_fm notation, e.g. 100.2 → "100.2M"
pub fn format_mhz(frequency_mhz: f64) -> String {
    let text = format!("{:.3}", frequency_mhz);
    let text = text.trim_end_matches('0').trim_end_matches('.');
    format!("{}M", text)
}

/// Parse rtl_fm notation back to MHz ("100.2M" → 100.2)
pub fn parse_mhz(value: &str) -> Option<f64> {
    value.trim().trim_end_matches(['M', 'm']).parse().ok()
}

fn rtl_fm(config: &Config, tuning: &Tuning, output_rate: &str) -> CommandSpec {
    let mut cmd = CommandSpec::new(&config.tools.rtl_fm).args([
        "-d".to_string(),
        config.device_index.to_string(),
        "-f".to_string(),
        format_mhz(tuning.frequency_mhz),
        "-M".to_string(),
        "fm".to_string(),
        "-s".to_string(),
        MPX_RATE.to_string(),
        "-A".to_string(),
        "fast".to_string(),
        "-r".to_string(),
        output_rate.to_string(),
        "-l".to_string(),
        "0".to_string(),
        "-E".to_string(),
        "deemp".to_string(),
    ]);

    if let Gain::Db(db) = tuning.gain {
        cmd = cmd.arg("-g").arg(db.to_string());
    }
    if config.ppm_error != 0 {
        cmd = cmd.arg("-p").arg(config.ppm_error.to_string());
    }
    cmd
}

/// `rtl_fm | redsea`: FM demodulation feeding the RDS decoder (JSON lines)
pub fn listen_pipeline(config: &Config, tuning: &Tuning) -> PipelineSpec {
    PipelineSpec::single(rtl_fm(config, tuning, MPX_RATE))
        .pipe(CommandSpec::new(&config.tools.redsea).arg("-u"))
}

/// `rtl_fm | ffmpeg`: live audio re-encoded to an MP3 byte stream
pub fn audio_pipeline(config: &Config, tuning: &Tuning) -> PipelineSpec {
    PipelineSpec::single(rtl_fm(config, tuning, AUDIO_RATE)).pipe(
        CommandSpec::new(&config.tools.ffmpeg).args([
            "-loglevel", "error", "-f", "s16le", "-ar", AUDIO_RATE, "-ac", "1", "-i", "-",
            "-acodec", "libmp3lame", "-ab", "128k", "-f", "mp3", "-",
        ]),
    )
}

/// Single-shot `rtl_power` sweep over the configured band, CSV on stdout
pub fn sweep_pipeline(config: &Config, gain: Gain) -> PipelineSpec {
    let range = format!(
        "{}:{}:{}k",
        format_mhz(config.band_start_mhz),
        format_mhz(config.band_end_mhz),
        config.sweep_step_khz
    );

    let mut cmd = CommandSpec::new(&config.tools.rtl_power).args([
        "-d".to_string(),
        config.device_index.to_string(),
        "-f".to_string(),
        range,
        "-i".to_string(),
        config.sweep_integration_secs.to_string(),
        "-1".to_string(),
    ]);
    if let Gain::Db(db) = gain {
        cmd = cmd.arg("-g").arg(db.to_string());
    }
    if config.ppm_error != 0 {
        cmd = cmd.arg("-p").arg(config.ppm_error.to_string());
    }
    PipelineSpec::single(cmd.arg("-"))
}

/// `welle-cli` with its built-in web server on a DAB channel
pub fn digital_pipeline(config: &Config, channel: &str) -> PipelineSpec {
    PipelineSpec::single(CommandSpec::new(&config.tools.welle_cli).args([
        "-c".to_string(),
        channel.to_string(),
        "-w".to_string(),
        config.dab_web_port.to_string(),
        "-D".to_string(),
        config.device_index.to_string(),
    ]))
}
