use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use super::{Streamer, TsStreamer};
use crate::config::StreamerConfig;
use crate::output::{TS_PACKET_SIZE, TS_SYNC_BYTE};
use crate::timestamp::StreamKind;

const WIDTH: u32 = 1920;
const HEIGHT: u32 = 1080;
const FPS: u32 = 60;
const RATE: u32 = 48000;
const CHUNK_FRAMES: usize = 1024;

fn scenario_config() -> StreamerConfig {
    StreamerConfig {
        video_preset: "ultrafast".into(),
        sample_rate: RATE,
        channels: 2,
        ..Default::default()
    }
}

/// Starts a streamer on an ephemeral port, or returns `None` when the local
/// FFmpeg build lacks the encoders.
fn start_streamer() -> anyhow::Result<Option<TsStreamer>> {
    let _ = env_logger::builder().is_test(true).try_init();
    crate::init()?;
    let mut streamer = TsStreamer::new(scenario_config());
    assert!(streamer.initialize(0, WIDTH, HEIGHT, FPS));
    if !streamer.start() {
        eprintln!("skip: mpegts streamer could not start (encoders unavailable?)");
        return Ok(None);
    }
    Ok(Some(streamer))
}

fn connect(streamer: &TsStreamer) -> anyhow::Result<TcpStream> {
    let port = streamer
        .local_addr()
        .ok_or(anyhow::anyhow!("streamer not listening"))?
        .port();
    let mut client = TcpStream::connect(("127.0.0.1", port))?;
    client.set_read_timeout(Some(Duration::from_secs(10)))?;
    client.write_all(b"GET /stream HTTP/1.1\r\nHost: localhost\r\n\r\n")?;
    let mut headers = Vec::new();
    let mut byte = [0u8; 1];
    while !headers.ends_with(b"\r\n\r\n") {
        if client.read(&mut byte)? == 0 {
            anyhow::bail!("connection closed during headers");
        }
        headers.push(byte[0]);
    }
    let headers = String::from_utf8(headers)?;
    assert!(headers.starts_with("HTTP/1.1 200 OK"), "{}", headers);
    assert!(headers.contains("Content-Type: video/mp2t"));
    Ok(client)
}

/// Reads until the server closes the connection.
fn collect(mut client: TcpStream) -> JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut body = Vec::new();
        let mut buf = [0u8; 64 * 1024];
        loop {
            match client.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => body.extend_from_slice(&buf[..n]),
            }
        }
        body
    })
}

fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    condition()
}

fn test_pattern(frame: u32) -> Vec<u8> {
    let mut data = vec![0u8; (WIDTH * HEIGHT * 3) as usize];
    for (i, pixel) in data.chunks_exact_mut(3).enumerate() {
        let x = (i as u32 % WIDTH) as u8;
        pixel.copy_from_slice(&[x.wrapping_add(frame as u8), (frame * 2) as u8, 128]);
    }
    data
}

fn tone(start: usize, frames: usize) -> Vec<i16> {
    (start..start + frames)
        .flat_map(|n| {
            let s = ((n as f32 * 440.0 * std::f32::consts::TAU / RATE as f32).sin() * 8000.0) as i16;
            [s, s]
        })
        .collect()
}

/// Pushes `frames` video frames at the stream cadence with audio in
/// 1024-frame chunks kept in step, calling `midway` halfway through.
fn capture(streamer: &TsStreamer, frames: u32, mut midway: impl FnMut()) {
    let frame_period = Duration::from_secs_f64(1.0 / FPS as f64);
    let started = Instant::now();
    let mut audio_frames = 0usize;
    let pictures = [test_pattern(0), test_pattern(1)];
    for i in 0..frames {
        let picture = &pictures[i as usize % pictures.len()];
        assert!(streamer.push_video_frame(picture, WIDTH, HEIGHT));
        let due = (i as usize + 1) * RATE as usize / FPS as usize;
        while audio_frames + CHUNK_FRAMES <= due {
            assert!(streamer.push_audio_samples(&tone(audio_frames, CHUNK_FRAMES)));
            audio_frames += CHUNK_FRAMES;
        }
        if i == frames / 2 {
            midway();
        }
        let next = frame_period * (i + 1);
        if let Some(wait) = next.checked_sub(started.elapsed()) {
            thread::sleep(wait);
        }
    }
}

fn assert_ts_aligned(body: &[u8]) {
    assert!(body.len() >= TS_PACKET_SIZE, "received only {} bytes", body.len());
    assert_eq!(body.len() % TS_PACKET_SIZE, 0);
    for (i, packet) in body.chunks(TS_PACKET_SIZE).enumerate() {
        assert_eq!(packet[0], TS_SYNC_BYTE, "sync lost at packet {}", i);
    }
}

/// Demuxes `body` and checks that each stream's DTS strictly increases.
/// Returns packet counts per codec type.
fn verify_with_demuxer(body: &[u8], name: &str) -> anyhow::Result<(usize, usize)> {
    let path = std::env::temp_dir().join(format!("{}-{}.ts", name, std::process::id()));
    std::fs::write(&path, body)?;
    let mut input = ffmpeg_next::format::input(&path)?;
    let kinds: HashMap<usize, ffmpeg_next::media::Type> = input
        .streams()
        .map(|s| (s.index(), s.parameters().medium()))
        .collect();

    let mut last_dts: HashMap<usize, i64> = HashMap::new();
    let (mut video, mut audio) = (0, 0);
    for (stream, packet) in input.packets() {
        match kinds.get(&stream.index()) {
            Some(ffmpeg_next::media::Type::Video) => video += 1,
            Some(ffmpeg_next::media::Type::Audio) => audio += 1,
            _ => continue,
        }
        let Some(dts) = packet.dts() else {
            continue;
        };
        if let Some(pts) = packet.pts() {
            assert!(pts >= dts, "pts {} before dts {}", pts, dts);
        }
        if let Some(last) = last_dts.insert(stream.index(), dts) {
            assert!(dts > last, "stream {} dts {} after {}", stream.index(), dts, last);
        }
    }
    std::fs::remove_file(&path)?;
    Ok((video, audio))
}

#[test]
fn live_client_receives_valid_transport_stream() -> anyhow::Result<()> {
    let Some(mut streamer) = start_streamer()? else {
        return Ok(());
    };
    assert!(streamer.is_active());
    assert!(streamer.stream_url().ends_with("/stream"));
    let stats = streamer.stats();

    let reader = collect(connect(&streamer)?);
    assert!(wait_for(|| streamer.client_count() == 1));

    let mut late: Option<JoinHandle<Vec<u8>>> = None;
    capture(&streamer, 120, || {
        assert_eq!(streamer.client_count(), 1);
        late = Some(collect(connect(&streamer).unwrap()));
    });
    assert!(wait_for(|| streamer.client_count() == 2));

    streamer.stop();
    assert!(!streamer.is_active());
    assert_eq!(streamer.client_count(), 0);
    assert!(!streamer.push_video_frame(&test_pattern(0), WIDTH, HEIGHT));

    let body = reader.join().unwrap();
    assert_ts_aligned(&body);
    let (video, audio) = verify_with_demuxer(&body, "live-client")?;
    assert!(video > 0, "no video packets");
    // packets flushed from the encoder on stop reach the client too
    assert_eq!(audio as u64, stats.packets(StreamKind::Audio));

    // a client joining mid-stream starts on a packet boundary and gets no
    // earlier data
    let late_body = late.unwrap().join().unwrap();
    assert_ts_aligned(&late_body);
    assert!(late_body.len() < body.len());
    assert!(body.ends_with(&late_body));
    Ok(())
}

#[test]
fn disconnected_client_is_counted_out() -> anyhow::Result<()> {
    let Some(mut streamer) = start_streamer()? else {
        return Ok(());
    };
    let staying = collect(connect(&streamer)?);
    let leaving = connect(&streamer)?;
    assert!(wait_for(|| streamer.client_count() == 2));

    drop(leaving);
    capture(&streamer, 30, || {});
    assert!(wait_for(|| streamer.client_count() == 1));

    streamer.stop();
    let body = staying.join().unwrap();
    assert_ts_aligned(&body);
    Ok(())
}

#[test]
fn partial_audio_frames_are_refused() -> anyhow::Result<()> {
    let Some(mut streamer) = start_streamer()? else {
        return Ok(());
    };
    assert!(!streamer.push_audio_samples(&[1, 2, 3]));
    assert!(streamer.push_audio_samples(&tone(0, CHUNK_FRAMES)));
    streamer.stop();
    Ok(())
}

#[test]
fn restart_after_stop() -> anyhow::Result<()> {
    let Some(mut streamer) = start_streamer()? else {
        return Ok(());
    };
    streamer.stop();
    streamer.stop();
    assert!(streamer.start());
    let reader = collect(connect(&streamer)?);
    capture(&streamer, 20, || {});
    streamer.stop();
    assert_ts_aligned(&reader.join().unwrap());
    Ok(())
}

#[test]
fn bind_failure_leaves_streamer_inactive() -> anyhow::Result<()> {
    crate::init()?;
    let taken = TcpListener::bind("0.0.0.0:0")?;
    let port = taken.local_addr()?.port();
    let mut streamer = TsStreamer::new(scenario_config());
    assert!(streamer.initialize(port, 640, 480, 30));
    assert!(!streamer.start());
    assert!(!streamer.is_active());
    assert!(streamer.local_addr().is_none());
    assert!(!streamer.push_audio_samples(&[0; 2048]));
    Ok(())
}

#[test]
fn packet_counts_track_input_rate() -> anyhow::Result<()> {
    crate::init()?;
    let (width, height, fps) = (640u32, 360u32, 30u32);
    let mut streamer = TsStreamer::new(scenario_config());
    assert!(streamer.initialize(0, width, height, fps));
    if !streamer.start() {
        eprintln!("skip: mpegts streamer could not start (encoders unavailable?)");
        return Ok(());
    }
    let stats = streamer.stats();
    let picture = vec![90u8; (width * height * 3) as usize];
    let period = Duration::from_secs_f64(1.0 / fps as f64);
    let started = Instant::now();
    let mut audio_frames = 0usize;
    for i in 0..2 * fps {
        assert!(streamer.push_video_frame(&picture, width, height));
        let due = (i as usize + 1) * RATE as usize / fps as usize;
        while audio_frames + CHUNK_FRAMES <= due {
            assert!(streamer.push_audio_samples(&tone(audio_frames, CHUNK_FRAMES)));
            audio_frames += CHUNK_FRAMES;
        }
        if let Some(wait) = (period * (i + 1)).checked_sub(started.elapsed()) {
            thread::sleep(wait);
        }
    }
    thread::sleep(Duration::from_millis(200));
    streamer.stop();

    let video = stats.packets(StreamKind::Video);
    let expected_video = 2 * fps as u64;
    assert!(
        video * 10 >= expected_video * 9 && video <= expected_video,
        "{} video packets for {} frames",
        video,
        expected_video
    );
    // aac consumes 1024 samples per channel per frame
    let expected_audio = (audio_frames / 1024) as u64;
    let audio = stats.packets(StreamKind::Audio);
    assert!(
        audio.abs_diff(expected_audio) <= 2,
        "{} audio packets, expected about {}",
        audio,
        expected_audio
    );
    Ok(())
}
