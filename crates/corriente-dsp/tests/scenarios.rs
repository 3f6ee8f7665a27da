//! End-to-end scenarios: full graphs rendered offline through the server.

use corriente_core::{Driver, HarmTable, MemorySink, NewTable, Server, ServerConfig, WinTable, Window};
use corriente_dsp::{
    CtrlIn, Delay, Fader, Fft, Granulator, Ifft, Resample, ResampleMode, Sine, TableRec,
};

/// A booted offline server plus shared access to the rendered samples.
fn offline_server(
    sample_rate: u32,
    buffer_size: usize,
    channels: usize,
    duration: f64,
) -> (Server, std::sync::Arc<parking_lot::Mutex<Vec<f32>>>) {
    let mut server = Server::new(ServerConfig {
        sample_rate,
        buffer_size,
        channels,
        ..ServerConfig::default()
    });
    let sink = MemorySink::new();
    let buffer = sink.buffer();
    server.boot(Driver::offline(sink, duration)).unwrap();
    (server, buffer)
}

/// A node holding a constant value: a zero-frequency sine offset by `add`.
fn constant(value: f64) -> Sine {
    Sine::new().freq(0.0).add(value)
}

#[test]
fn sine_matches_closed_form_for_one_buffer() {
    // 440 Hz at 44100 Hz, mono; 1 ms rounds up to a single 64-frame cycle.
    let (mut server, buffer) = offline_server(44100, 64, 1, 0.001);
    let osc = server.add(Sine::new().freq(440.0)).unwrap();
    osc.out(&mut server, 0, 1, 0.0, 0.0).unwrap();
    server.start().unwrap();

    let rendered = buffer.lock();
    assert_eq!(rendered.len(), 64);
    for (n, &v) in rendered.iter().enumerate() {
        let want = (2.0 * std::f64::consts::PI * 440.0 * n as f64 / 44100.0).sin() as f32;
        assert!((v - want).abs() < 1e-5, "sample {n}: {v} vs {want}");
    }
}

#[test]
fn expanded_sine_mixes_down_to_one_stream() {
    // A single 64-frame cycle, so the peeked first sample is sample 0.
    let (mut server, _) = offline_server(44100, 64, 1, 0.001);
    let osc = server.add(Sine::new().freq([100.0, 200.0, 300.0])).unwrap();
    assert_eq!(osc.nstreams(), 3);

    let mixed = osc.mix(&mut server, 1).unwrap();
    assert_eq!(mixed.nstreams(), 1);
    server.start().unwrap();

    // First sample of every voice is sin(0); their sum is exactly zero.
    assert!(mixed.get(&server).abs() < 1e-6);
    assert_eq!(osc.get_all(&server).len(), 3);
}

#[test]
fn mix_two_voices_is_round_robin() {
    let (mut server, _) = offline_server(1000, 8, 1, 8.0 / 1000.0);
    let four = server
        .add(Sine::new().freq(0.0).add([1.0, 2.0, 4.0, 8.0]))
        .unwrap();
    let pair = four.mix(&mut server, 2).unwrap();
    server.start().unwrap();

    // Streams [a, b, c, d] fold to [a + c, b + d].
    assert_eq!(pair.get_all(&server), vec![5.0, 10.0]);
}

#[test]
fn table_recording_fills_table_and_triggers_once() {
    // One second recorded one sample at a time: 44100 cycles of size 1.
    let (mut server, buffer) = offline_server(44100, 1, 1, 1.0);
    let table = server.add_table(NewTable::new(1.0)).unwrap();
    assert_eq!(table.info(&server).unwrap().size, 44100);

    let rec = server.add(TableRec::new(1.0, table)).unwrap();
    // Routing the recorder out makes its trigger pulse observable.
    rec.out(&mut server, 0, 1, 0.0, 0.0).unwrap();
    server.start().unwrap();

    let recorded = server.table_samples(&table, 0).unwrap();
    assert_eq!(recorded.len(), 44100);
    assert!(recorded.iter().all(|&v| v == 1.0));

    let rendered = buffer.lock();
    let triggers = rendered.iter().filter(|&&v| v == 1.0).count();
    assert_eq!(triggers, 1, "exactly one completion trigger");
}

#[test]
fn input_swap_never_jumps_faster_than_the_fade() {
    let sr = 44100u32;
    let fade = 0.01f64;
    let (mut server, buffer) = offline_server(sr, 64, 1, 0.05);

    let a = server.add(constant(1.0)).unwrap();
    let b = server.add(constant(-1.0)).unwrap();
    let pass = server.add(Delay::new(a).delay(0.0).maxdelay(0.001)).unwrap();
    pass.out(&mut server, 0, 1, 0.0, 0.0).unwrap();

    // Queue the swap before rendering; the fade spans the first cycles.
    pass.set_input(&mut server, b, fade).unwrap();
    server.start().unwrap();

    let rendered = buffer.lock();
    let bound = 2.0 / (fade * f64::from(sr)) as f32 + 1e-4;
    for w in rendered[2..].windows(2) {
        let delta = (w[1] - w[0]).abs();
        assert!(delta <= bound, "delta {delta} exceeds fade slope {bound}");
    }
    assert!((rendered.last().unwrap() + 1.0).abs() < 1e-3);
}

#[test]
fn out_honors_delay_and_duration_window() {
    // 4 cycles of 10 samples at 1 kHz.
    let (mut server, buffer) = offline_server(1000, 10, 1, 0.04);
    let one = server.add(constant(1.0)).unwrap();
    // Audible from sample 10 for 20 samples.
    one.out(&mut server, 0, 1, 0.02, 0.01).unwrap();
    server.start().unwrap();

    let rendered = buffer.lock();
    assert!(rendered.len() >= 40);
    assert!(rendered[..10].iter().all(|&v| v == 0.0), "before delay");
    assert!(rendered[10..30].iter().all(|&v| v == 1.0), "inside window");
    assert!(rendered[30..].iter().all(|&v| v == 0.0), "after duration");
}

#[test]
fn control_only_nodes_accept_out_silently() {
    let (mut server, buffer) = offline_server(1000, 10, 1, 0.01);
    let env = server.add(Fader::new().fadein(0.001)).unwrap();
    // Chaining .out() on a control node must never fail.
    env.out(&mut server, 0, 1, 0.0, 0.0).unwrap();
    server.start().unwrap();
    // And it must never reach the bus.
    assert!(buffer.lock().iter().all(|&v| v == 0.0));
}

#[test]
fn envelope_scales_a_constant_source() {
    let (mut server, buffer) = offline_server(1000, 10, 1, 0.1);
    let env = server.add(Fader::new().fadein(0.05).fadeout(0.01)).unwrap();
    let mut sig = constant(1.0);
    sig = sig.mul(env);
    let node = server.add(sig).unwrap();
    node.out(&mut server, 0, 1, 0.0, 0.0).unwrap();
    server.start().unwrap();

    let rendered = buffer.lock();
    // Linear 50 ms attack at 1 kHz: half way up at sample 25.
    assert!(rendered[0] < 1e-6);
    assert!((rendered[25] - 0.5).abs() < 0.05);
    assert!((rendered[75] - 1.0).abs() < 1e-3);
}

#[test]
fn external_events_reach_control_nodes() {
    let (mut server, _) = offline_server(1000, 10, 1, 0.02);
    let ctrl = server.add(CtrlIn::new(7).slew(0.0)).unwrap();

    let sender = server.event_sender();
    sender
        .send(corriente_core::ControlEvent {
            channel: 7,
            value: 0.8,
            timestamp: 0.0,
        })
        .unwrap();
    server.start().unwrap();

    assert!((ctrl.get(&server) - 0.8).abs() < 1e-6);
}

#[test]
fn resampling_block_scales_node_buffers() {
    let (mut server, buffer) = offline_server(44100, 64, 1, 0.001);

    server.begin_resampling_block(2).unwrap();
    let fast = server.add(Sine::new().freq(440.0)).unwrap();
    server.end_resampling_block().unwrap();

    let down = server
        .add(Resample::new(fast).mode(ResampleMode::Average))
        .unwrap();
    down.out(&mut server, 0, 1, 0.0, 0.0).unwrap();
    server.start().unwrap();

    let rendered = buffer.lock();
    assert_eq!(rendered.len(), 64);
    // Pair-averaged 88.2 kHz sine: alive, bounded, and close to the base
    // rate sine midway between consecutive sample pairs.
    assert!(rendered.iter().any(|v| v.abs() > 0.01));
    assert!(rendered.iter().all(|v| v.abs() <= 1.0));
    for (n, &v) in rendered.iter().enumerate() {
        let t0 = 2.0 * n as f64;
        let a = (2.0 * std::f64::consts::PI * 440.0 * t0 / 88200.0).sin();
        let b = (2.0 * std::f64::consts::PI * 440.0 * (t0 + 1.0) / 88200.0).sin();
        let want = ((a + b) / 2.0) as f32;
        assert!((v - want).abs() < 1e-4, "sample {n}");
    }
}

#[test]
fn spectral_pair_reconstructs_a_constant() {
    let (mut server, buffer) = offline_server(1000, 32, 1, 0.8);
    let src = server.add(constant(1.0)).unwrap();
    let spectrum = server.add(Fft::new(src).size(64).overlaps(2)).unwrap();
    // One voice, two overlap branches, a real/imaginary pair each.
    assert_eq!(spectrum.nstreams(), 4);

    let resynth = server
        .add(Ifft::new(spectrum).size(64).overlaps(2))
        .unwrap();
    assert_eq!(resynth.nstreams(), 1);
    resynth.out(&mut server, 0, 1, 0.0, 0.0).unwrap();
    server.start().unwrap();

    let rendered = buffer.lock();
    // Past the analysis/resynthesis warmup the constant comes back.
    for (n, &v) in rendered[6 * 64..].iter().enumerate() {
        assert!((v - 1.0).abs() < 0.05, "sample {n}: {v}");
    }
}

#[test]
fn granulator_produces_sound_from_a_table() {
    let (mut server, buffer) = offline_server(44100, 256, 1, 0.2);
    let source = server
        .add_table(HarmTable::new(vec![1.0, 0.5]).size(8192))
        .unwrap();
    let env = server
        .add_table(WinTable::new(Window::Hann).size(1024))
        .unwrap();
    let grains = server
        .add(
            Granulator::new(source, env)
                .pitch(1.0)
                .pos(2048.0)
                .dur(0.05)
                .grains(8),
        )
        .unwrap();
    grains.out(&mut server, 0, 1, 0.0, 0.0).unwrap();
    server.start().unwrap();

    let rendered = buffer.lock();
    let tail = &rendered[4410..];
    assert!(tail.iter().any(|v| v.abs() > 0.05), "granulator is silent");
    assert!(rendered.iter().all(|v| v.abs() < 8.0));
}

#[test]
fn stopping_a_source_silences_downstream() {
    let (mut server, buffer) = offline_server(1000, 10, 1, 0.03);
    let one = server.add(constant(1.0)).unwrap();
    one.out(&mut server, 0, 1, 0.0, 0.0).unwrap();
    // Immediate stop before rendering: nothing should reach the bus.
    one.stop(&mut server, 0.0).unwrap();
    server.start().unwrap();
    assert!(buffer.lock().iter().all(|&v| v == 0.0));
}
