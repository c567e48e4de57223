//! Capstan Play - command-line transport demo
//!
//! Wires capstan-core and capstan-midi into a small player: WAV
//! playback over a selection, recording, MIDI sequence dispatch, input
//! monitoring, and a scrub exerciser.
//!
//! ## Usage
//!
//! ```text
//! capstan-play track.wav                      play the whole file
//! capstan-play track.wav --from 10 --to 20    play a selection
//! capstan-play track.wav --loop               loop the selection
//! capstan-play track.wav --record             overdub to a timestamped WAV
//! capstan-play --record                       capture only
//! capstan-play song.mid --midi-port fluid     play MIDI through a synth
//! capstan-play track.wav --scrub-test         drive the scrub queue
//! capstan-play --monitor                      meter the input, no stream
//! capstan-play --devices                      print device reports
//! ```
//!
//! Set RUST_LOG=debug for verbose engine output.

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Context;

use capstan_core::audio::device_report;
use capstan_core::config::{default_config_path, load_config, TransportSettings};
use capstan_core::engine::{
    AudioTransport, CaptureTrack, ChannelMap, MemoryPlaybackSource, PlaybackTrack,
    TransportListener, TransportTracks, WavCaptureSink,
};
use capstan_core::schedule::{ScrubbingOptions, StartStreamOptions};
use capstan_core::types::{Sample, SampleFormat, DEFAULT_SAMPLE_RATE};
use capstan_midi::{load_sequences, midi_device_report, MidiOutputSynchronizer, MidiTrack};

/// Progress readout period
const POLL: Duration = Duration::from_millis(100);

/// Logs lifecycle callbacks so the listener seam shows up in the output
struct ConsoleListener;

impl TransportListener for ConsoleListener {
    fn on_rate_changed(&self, rate: f64) {
        log::info!("stream rate: {} Hz", rate);
    }

    fn on_recording_start(&self) {
        log::info!("recording started");
    }

    fn on_recording_stop(&self) {
        log::info!("recording stopped, capture sinks flushed");
    }

    fn on_playback(&self, active: bool) {
        log::debug!("playback active: {}", active);
    }

    fn on_capture(&self, active: bool) {
        log::debug!("capture active: {}", active);
    }
}

fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();

    // Initialize logger - set RUST_LOG=debug for verbose output
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    if flag(&args, "--help") || flag(&args, "-h") {
        print_usage();
        return Ok(());
    }

    println!("╔════════════════════════════════════════╗");
    println!("║              Capstan Play              ║");
    println!("║      WAV + MIDI transport demo         ║");
    println!("╚════════════════════════════════════════╝");
    println!();

    if flag(&args, "--devices") {
        print!("{}", device_report());
        print!("{}", midi_device_report());
        return Ok(());
    }

    let config_path = default_config_path();
    let settings: TransportSettings = load_config(&config_path);
    log::info!("settings loaded from {:?}", config_path);

    let mut transport = AudioTransport::new(settings, Some(Arc::new(ConsoleListener)));

    let desired = value_f64(&args, "--rate")?
        .or(transport.settings().preferred_rate)
        .unwrap_or(DEFAULT_SAMPLE_RATE);

    if flag(&args, "--monitor") {
        return run_monitor(&mut transport, desired);
    }

    let (wav_path, midi_path) = positional_paths(&args);
    let t0 = value_f64(&args, "--from")?.unwrap_or(0.0);
    let looped = flag(&args, "--loop");
    let record = flag(&args, "--record");
    let scrub_test = flag(&args, "--scrub-test");

    let mut tracks = TransportTracks::default();
    let mut content_end: f64 = 0.0;

    if let Some(path) = &wav_path {
        let (channels, source_rate) = load_wav(path)?;
        content_end = channels
            .first()
            .map_or(0.0, |c| c.len() as f64 / source_rate);
        println!(
            "  {}: {} channel(s), {:.2} s at {} Hz",
            path.display(),
            channels.len(),
            content_end,
            source_rate
        );
        let stereo = channels.len() > 1;
        for (index, samples) in channels.into_iter().enumerate() {
            let channel = if !stereo {
                ChannelMap::Mono
            } else if index == 0 {
                ChannelMap::Left
            } else {
                ChannelMap::Right
            };
            tracks.playback.push(PlaybackTrack::new(
                Box::new(MemoryPlaybackSource::new(samples, source_rate)),
                channel,
            ));
        }
    }

    if let Some(path) = &midi_path {
        let sequences =
            load_sequences(path).with_context(|| format!("loading {}", path.display()))?;
        let mut midi_tracks = Vec::new();
        for sequence in sequences {
            println!(
                "  MIDI {}: {} events, {:.2} s",
                sequence.name(),
                sequence.len(),
                sequence.end_time()
            );
            content_end = content_end.max(sequence.end_time());
            midi_tracks.push(MidiTrack::new(sequence));
        }
        let mut sync =
            MidiOutputSynchronizer::new(midi_tracks, transport.settings().midi_synth_latency_ms);
        if let Some(pattern) = value(&args, "--midi-port") {
            sync = sync.with_port_match(pattern);
        }
        tracks.midi = Some(Arc::new(sync));
    }

    let playing = !tracks.playback.is_empty() || tracks.midi.is_some();
    let rate = transport
        .get_best_rate(playing, record, desired)
        .unwrap_or(desired);

    let mut record_path = None;
    if record {
        let name = format!(
            "capstan-{}.wav",
            chrono::Local::now().format("%Y-%m-%d_%H-%M-%S")
        );
        let path = PathBuf::from(name);
        let sink = WavCaptureSink::create(&path, rate, SampleFormat::Int16)
            .with_context(|| format!("creating {}", path.display()))?;
        tracks
            .capture
            .push(CaptureTrack::new(Box::new(sink), SampleFormat::Int16));
        println!("  recording to {}", path.display());
        record_path = Some(path);
    }

    if tracks.playback.is_empty() && tracks.capture.is_empty() && tracks.midi.is_none() {
        print_usage();
        anyhow::bail!("nothing to play or record");
    }

    let t1 = value_f64(&args, "--to")?.unwrap_or(if content_end > t0 {
        content_end
    } else {
        t0 + 30.0
    });

    let scrub_options = ScrubbingOptions {
        delay: 0.05,
        min_speed: 0.2,
        max_speed: 2.5,
        min_stutter: (0.02 * rate) as i64,
        ..ScrubbingOptions::default()
    };
    let mut options = StartStreamOptions {
        rate,
        looped,
        ..StartStreamOptions::default()
    };
    if scrub_test {
        options.scrubbing = Some(scrub_options.clone());
    }

    let token = transport
        .start_stream(tracks, t0, t1, options)
        .context("starting stream")?;
    log::info!("stream {} running", token);
    println!(
        "  playing [{:.2}, {:.2}) s at {} Hz{}",
        t0,
        t1,
        rate,
        if looped { ", looped" } else { "" }
    );

    let limit = value_f64(&args, "--duration")?.unwrap_or(if looped || scrub_test {
        12.0
    } else {
        (t1 - t0) + 2.0
    });

    if scrub_test {
        run_scrub_sweep(&transport, t0, t1, &scrub_options, limit);
    } else {
        run_until_done(&transport, t1, looped, limit);
    }

    transport.stop_stream();

    let lost = transport.lost_samples();
    if lost > 0 {
        let intervals = transport.take_lost_intervals();
        println!("  {} samples lost across {} dropout(s)", lost, intervals.len());
        for interval in intervals {
            println!(
                "    at {:.3} s for {:.3} s",
                interval.start, interval.duration
            );
        }
    }
    if let Some(path) = record_path {
        println!("  capture written to {}", path.display());
    }
    Ok(())
}

fn run_until_done(transport: &AudioTransport, t1: f64, looped: bool, limit: f64) {
    let started = Instant::now();
    while started.elapsed().as_secs_f64() < limit {
        let time = transport.stream_time();
        let out = transport.output_levels();
        let input = transport.input_levels();
        print!("\r  t = {:7.2} s  {}{}", time, meter(&out), meter(&input));
        flush_stdout();
        if !looped && time >= t1 - 1e-3 {
            break;
        }
        thread::sleep(POLL);
    }
    println!();
}

/// Sweep the scrub target across the selection like a slow drag
fn run_scrub_sweep(
    transport: &AudioTransport,
    t0: f64,
    t1: f64,
    options: &ScrubbingOptions,
    limit: f64,
) {
    let started = Instant::now();
    let span = (t1 - t0).max(0.1);
    while started.elapsed().as_secs_f64() < limit {
        let phase = started.elapsed().as_secs_f64() * 0.4;
        let cycle = (phase % 2.0 - 1.0).abs();
        let target = t0 + span * cycle;
        if !transport.enqueue_scrub(target, options) {
            log::debug!("scrub queue full, gesture dropped");
        }
        print!(
            "\r  gesture {:6.2} s -> played {:6.2} s",
            target,
            transport.stream_time()
        );
        flush_stdout();
        thread::sleep(Duration::from_millis(50));
    }
    println!();
}

fn run_monitor(transport: &mut AudioTransport, rate: f64) -> anyhow::Result<()> {
    transport
        .start_monitoring(rate)
        .context("starting input monitoring")?;
    println!(
        "  monitoring input for 6 s (playthrough: {})",
        transport.settings().playthrough
    );
    let started = Instant::now();
    while started.elapsed() < Duration::from_secs(6) {
        print!("\r  in {}", meter(&transport.input_levels()));
        flush_stdout();
        thread::sleep(POLL);
    }
    println!();
    transport.stop_monitoring();
    Ok(())
}

/// One `[====    ]` bar per channel
fn meter(levels: &[f64]) -> String {
    levels
        .iter()
        .map(|level| {
            let n = (level * 12.0).round().clamp(0.0, 12.0) as usize;
            format!(" [{:<12}]", "=".repeat(n))
        })
        .collect::<String>()
}

fn flush_stdout() {
    use std::io::Write as _;
    let _ = std::io::stdout().flush();
}

fn flag(args: &[String], name: &str) -> bool {
    args.iter().any(|a| a == name)
}

fn value(args: &[String], name: &str) -> Option<String> {
    args.iter()
        .position(|a| a == name)
        .and_then(|i| args.get(i + 1))
        .cloned()
}

fn value_f64(args: &[String], name: &str) -> anyhow::Result<Option<f64>> {
    value(args, name)
        .map(|v| {
            v.parse::<f64>()
                .with_context(|| format!("{} expects a number, got '{}'", name, v))
        })
        .transpose()
}

/// Split positional arguments into (wav, midi) by extension
fn positional_paths(args: &[String]) -> (Option<PathBuf>, Option<PathBuf>) {
    const VALUE_FLAGS: [&str; 5] = ["--from", "--to", "--midi-port", "--duration", "--rate"];
    let mut wav = None;
    let mut midi = None;
    let mut skip = false;
    for arg in args {
        if skip {
            skip = false;
            continue;
        }
        if VALUE_FLAGS.contains(&arg.as_str()) {
            skip = true;
            continue;
        }
        if arg.starts_with("--") {
            continue;
        }
        let path = PathBuf::from(arg);
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase());
        match extension.as_deref() {
            Some("mid") | Some("midi") => midi = Some(path),
            _ => wav = Some(path),
        }
    }
    (wav, midi)
}

/// Decode a WAV file to at most two channels of f32 samples
fn load_wav(path: &std::path::Path) -> anyhow::Result<(Vec<Vec<Sample>>, f64)> {
    let mut reader =
        hound::WavReader::open(path).with_context(|| format!("opening {}", path.display()))?;
    let spec = reader.spec();
    let channels = spec.channels.max(1) as usize;
    let kept = channels.min(2);
    let mut data: Vec<Vec<Sample>> = vec![Vec::new(); kept];

    match spec.sample_format {
        hound::SampleFormat::Float => {
            for (index, sample) in reader.samples::<f32>().enumerate() {
                let channel = index % channels;
                if channel < kept {
                    data[channel].push(sample?);
                }
            }
        }
        hound::SampleFormat::Int => {
            let scale = 1.0 / (1i64 << (spec.bits_per_sample - 1)) as Sample;
            for (index, sample) in reader.samples::<i32>().enumerate() {
                let channel = index % channels;
                if channel < kept {
                    data[channel].push(sample? as Sample * scale);
                }
            }
        }
    }
    Ok((data, f64::from(spec.sample_rate)))
}

fn print_usage() {
    println!("usage: capstan-play [FILE.wav] [FILE.mid] [options]");
    println!();
    println!("options:");
    println!("  --from SECS       selection start (default 0)");
    println!("  --to SECS         selection end (default: content length)");
    println!("  --loop            loop the selection");
    println!("  --record          capture input to a timestamped WAV");
    println!("  --midi-port PAT   substring match for the MIDI output port");
    println!("  --scrub-test      drive playback from a synthetic scrub gesture");
    println!("  --monitor         meter the input without starting a stream");
    println!("  --duration SECS   stop after this long regardless");
    println!("  --rate HZ         preferred sample rate");
    println!("  --devices         print audio and MIDI device reports");
}
