//! XM to WAV renderer
use clap::Parser;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// A file path to an XM module.
    xm_file: String,

    /// Output WAV file path.
    #[arg(short, long, default_value = "out.wav")]
    output: String,

    /// Output sample rate in Hz.
    #[arg(short, long, default_value_t = 48000)]
    rate: u16,

    /// Stop after the module has played through this many times.
    #[arg(short, long, default_value_t = 1, value_parser = loops_in_range)]
    loops: u8,

    /// Print the analyze report instead of rendering.
    #[arg(short, long)]
    analyze: bool,

    /// Log verbosity level.
    #[arg(short, long, action = clap::ArgAction::Count)]
    debug: u8,
}

fn loops_in_range(s: &str) -> Result<u8, String> {
    let loops: u8 = s.parse().map_err(|_| format!("`{s}` isn't a loop count"))?;
    if loops > 0 {
        Ok(loops)
    } else {
        Err("loop count must be at least 1".into())
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    simple_logger::init_with_level(match args.debug {
        0 => log::Level::Warn,
        1 => log::Level::Info,
        2 => log::Level::Debug,
        _ => log::Level::Trace,
    })?;

    log::info!("Loading XM file: {}", args.xm_file);
    let mut ctx = xm_file_player::load_file(&args.xm_file, args.rate)?;

    log::info!(
        r#""{}" written by {}, {} channels, {} patterns, {} instruments"#,
        ctx.module_name().trim(),
        ctx.tracker_name().trim(),
        ctx.num_channels(),
        ctx.num_patterns(),
        ctx.num_instruments()
    );
    let (bpm, tempo) = ctx.playing_speed();
    log::debug!("Initial speed: {} BPM, {} ticks per row", bpm, tempo);

    if args.analyze {
        println!("{}", ctx.analyze());
        return Ok(());
    }

    ctx.set_max_loop_count(args.loops);

    let spec = hound::WavSpec {
        channels: 2,
        sample_rate: u32::from(args.rate),
        bits_per_sample: 32,
        sample_format: hound::SampleFormat::Float,
    };
    let mut writer = hound::WavWriter::create(&args.output, spec)?;

    let mut buffer = [0.0f32; 4096];
    while ctx.loop_count() < args.loops {
        ctx.generate_samples(&mut buffer);
        for &value in buffer.iter() {
            writer.write_sample(value)?;
        }
    }
    writer.finalize()?;

    let (_, _, _, frames) = ctx.position();
    log::info!(
        "Wrote {} ({:.1}s of audio)",
        args.output,
        frames as f64 / f64::from(args.rate)
    );
    Ok(())
}
