//! Polyphonic sine test synth.
//!
//! One sine voice per held note, velocity-scaled, summed to every output
//! channel. Events are applied at their sample offsets, so a note-on landing
//! mid-block starts sounding exactly there.

use ostinato_core::processor::{ParamDescriptor, Processor};
use ostinato_core::{AudioBuffer, EventPayload, TimedEvent};

const MAX_VOICES: usize = 32;
const ALL_NOTES_OFF: u8 = 123;

struct Voice {
    channel: u8,
    note: u8,
    velocity: f32,
    phase: f32,
    increment: f32,
}

pub struct TestSynth {
    sample_rate: f64,
    gain: f32,
    voices: Vec<Voice>,
}

impl TestSynth {
    pub fn new() -> Self {
        Self {
            sample_rate: 44100.0,
            gain: 1.0,
            voices: Vec::with_capacity(MAX_VOICES),
        }
    }

    pub fn voice_count(&self) -> usize {
        self.voices.len()
    }

    fn note_frequency(note: u8) -> f32 {
        440.0 * 2.0f32.powf((note as f32 - 69.0) / 12.0)
    }

    fn note_on(&mut self, channel: u8, note: u8, velocity: f32) {
        let increment =
            core::f32::consts::TAU * Self::note_frequency(note) / self.sample_rate as f32;
        if let Some(voice) = self
            .voices
            .iter_mut()
            .find(|v| v.channel == channel && v.note == note)
        {
            // Retrigger in place.
            voice.velocity = velocity;
            voice.phase = 0.0;
            return;
        }
        if self.voices.len() == MAX_VOICES {
            self.voices.remove(0);
        }
        self.voices.push(Voice {
            channel,
            note,
            velocity,
            phase: 0.0,
            increment,
        });
    }

    fn note_off(&mut self, channel: u8, note: u8) {
        self.voices
            .retain(|v| !(v.channel == channel && v.note == note));
    }

    fn apply(&mut self, payload: &EventPayload) {
        match *payload {
            EventPayload::NoteOn {
                channel,
                note,
                velocity,
            } => self.note_on(channel, note, velocity),
            EventPayload::NoteOff { channel, note } => self.note_off(channel, note),
            EventPayload::ControlChange {
                controller, value, ..
            } => match controller {
                ALL_NOTES_OFF => self.voices.clear(),
                // CC 7: channel volume.
                7 => self.gain = value as f32 / 127.0,
                _ => {}
            },
            EventPayload::ParamChange { .. } => {}
        }
    }

    fn render(&mut self, buffer: &mut AudioBuffer, from: usize, to: usize) {
        for voice in &mut self.voices {
            let mut phase = voice.phase;
            let amp = voice.velocity * self.gain;
            for i in from..to {
                let sample = phase.sin() * amp;
                for ch in 0..buffer.num_channels() {
                    buffer.channel_mut(ch)[i] += sample;
                }
                phase += voice.increment;
                if phase >= core::f32::consts::TAU {
                    phase -= core::f32::consts::TAU;
                }
            }
            voice.phase = phase;
        }
    }
}

impl Default for TestSynth {
    fn default() -> Self {
        Self::new()
    }
}

impl Processor for TestSynth {
    fn name(&self) -> &str {
        "TestSynth"
    }

    fn prepare(&mut self, sample_rate: f64, _block_size: usize) {
        self.sample_rate = sample_rate;
        for voice in &mut self.voices {
            voice.increment =
                core::f32::consts::TAU * Self::note_frequency(voice.note) / sample_rate as f32;
        }
    }

    fn reset(&mut self) {
        self.voices.clear();
    }

    fn process(&mut self, buffer: &mut AudioBuffer) {
        let frames = buffer.frames();
        self.render(buffer, 0, frames);
    }

    fn process_with_events(&mut self, buffer: &mut AudioBuffer, events: &[TimedEvent]) {
        let frames = buffer.frames();
        let mut cursor = 0;
        for event in events {
            let offset = event.sample_offset.min(frames);
            if offset > cursor {
                self.render(buffer, cursor, offset);
                cursor = offset;
            }
            self.apply(&event.payload);
        }
        self.render(buffer, cursor, frames);
    }

    fn param_descriptors(&self) -> Vec<ParamDescriptor> {
        vec![ParamDescriptor::continuous("gain", 1.0, 0.0, 1.0)]
    }

    fn param(&self, name: &str) -> f32 {
        if name == "gain" {
            self.gain
        } else {
            0.0
        }
    }

    fn set_param(&mut self, name: &str, value: f32) {
        if name == "gain" {
            self.gain = value.clamp(0.0, 1.0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn note_on_at(offset: usize, note: u8, velocity: f32) -> TimedEvent {
        TimedEvent {
            sample_offset: offset,
            payload: EventPayload::NoteOn {
                channel: 1,
                note,
                velocity,
            },
        }
    }

    fn note_off_at(offset: usize, note: u8) -> TimedEvent {
        TimedEvent {
            sample_offset: offset,
            payload: EventPayload::NoteOff { channel: 1, note },
        }
    }

    #[test]
    fn test_silent_without_notes() {
        let mut synth = TestSynth::new();
        let mut buffer = AudioBuffer::new(2, 256);
        synth.process(&mut buffer);
        assert_eq!(buffer.peak(), 0.0);
    }

    #[test]
    fn test_note_on_produces_signal() {
        let mut synth = TestSynth::new();
        synth.prepare(44100.0, 256);
        let mut buffer = AudioBuffer::new(2, 256);
        synth.process_with_events(&mut buffer, &[note_on_at(0, 69, 0.8)]);
        assert!(buffer.peak() > 0.1);
        assert_eq!(synth.voice_count(), 1);
    }

    #[test]
    fn test_note_starts_at_offset() {
        let mut synth = TestSynth::new();
        synth.prepare(44100.0, 256);
        let mut buffer = AudioBuffer::new(2, 256);
        synth.process_with_events(&mut buffer, &[note_on_at(100, 60, 1.0)]);
        assert!(buffer.channel(0)[..100].iter().all(|&s| s == 0.0));
        assert!(buffer.channel(0)[100..].iter().any(|&s| s != 0.0));
    }

    #[test]
    fn test_note_off_removes_voice() {
        let mut synth = TestSynth::new();
        synth.prepare(44100.0, 256);
        let mut buffer = AudioBuffer::new(2, 256);
        synth.process_with_events(
            &mut buffer,
            &[note_on_at(0, 60, 1.0), note_off_at(128, 60)],
        );
        assert_eq!(synth.voice_count(), 0);
        // Tail after the note-off is silent.
        assert!(buffer.channel(0)[128..].iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_velocity_scales_amplitude() {
        let mut loud = TestSynth::new();
        let mut quiet = TestSynth::new();
        loud.prepare(44100.0, 512);
        quiet.prepare(44100.0, 512);

        let mut loud_buf = AudioBuffer::new(2, 512);
        let mut quiet_buf = AudioBuffer::new(2, 512);
        loud.process_with_events(&mut loud_buf, &[note_on_at(0, 69, 1.0)]);
        quiet.process_with_events(&mut quiet_buf, &[note_on_at(0, 69, 0.25)]);
        assert!(loud_buf.peak() > quiet_buf.peak() * 3.0);
    }

    #[test]
    fn test_all_notes_off_cc() {
        let mut synth = TestSynth::new();
        synth.prepare(44100.0, 256);
        let mut buffer = AudioBuffer::new(2, 256);
        synth.process_with_events(
            &mut buffer,
            &[note_on_at(0, 60, 1.0), note_on_at(0, 64, 1.0)],
        );
        assert_eq!(synth.voice_count(), 2);

        let cc = TimedEvent {
            sample_offset: 0,
            payload: EventPayload::ControlChange {
                channel: 1,
                controller: ALL_NOTES_OFF,
                value: 0,
            },
        };
        let mut next = AudioBuffer::new(2, 256);
        synth.process_with_events(&mut next, &[cc]);
        assert_eq!(synth.voice_count(), 0);
        assert_eq!(next.peak(), 0.0);
    }

    #[test]
    fn test_reset_clears_voices() {
        let mut synth = TestSynth::new();
        synth.prepare(44100.0, 256);
        let mut buffer = AudioBuffer::new(2, 256);
        synth.process_with_events(&mut buffer, &[note_on_at(0, 60, 1.0)]);
        synth.reset();
        assert_eq!(synth.voice_count(), 0);
    }

    #[test]
    fn test_retrigger_does_not_stack_voices() {
        let mut synth = TestSynth::new();
        synth.prepare(44100.0, 256);
        let mut buffer = AudioBuffer::new(2, 256);
        synth.process_with_events(
            &mut buffer,
            &[note_on_at(0, 60, 0.5), note_on_at(64, 60, 1.0)],
        );
        assert_eq!(synth.voice_count(), 1);
    }
}
