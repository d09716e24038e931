//! Bit-exact encoders for the bulk and control command frames the scopes
//! understand. Field placement differs per model family; each encoder owns
//! the byte buffer for exactly one wire frame.

/// Bulk command opcodes. The opcode is also the first byte of the frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum BulkCode {
    SetTriggerAndSamplerate = 0x01,
    ForceTrigger = 0x02,
    StartSampling = 0x03,
    EnableTrigger = 0x04,
    GetData = 0x05,
    GetCaptureState = 0x06,
    SetGain = 0x07,
    BSetChannels = 0x0b,
    CSetTriggerOrSamplerate = 0x0c,
    DSetBuffer = 0x0d,
    ESetTriggerOrSamplerate = 0x0e,
    FSetBuffer = 0x0f,
}

impl BulkCode {
    /// Size of the opcode-indexed command slot array.
    pub const SLOTS: usize = 0x10;

    /// Every opcode in ascending wire order. Pending commands are flushed
    /// in this order.
    pub const ALL: [BulkCode; 12] = [
        BulkCode::SetTriggerAndSamplerate,
        BulkCode::ForceTrigger,
        BulkCode::StartSampling,
        BulkCode::EnableTrigger,
        BulkCode::GetData,
        BulkCode::GetCaptureState,
        BulkCode::SetGain,
        BulkCode::BSetChannels,
        BulkCode::CSetTriggerOrSamplerate,
        BulkCode::DSetBuffer,
        BulkCode::ESetTriggerOrSamplerate,
        BulkCode::FSetBuffer,
    ];

    pub fn from_code(code: u8) -> Option<BulkCode> {
        Self::ALL.iter().copied().find(|&c| c as u8 == code)
    }
}

/// Control request codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ControlCode {
    Value = 0xa2,
    GetSpeed = 0xb2,
    BeginCommand = 0xb3,
    SetOffset = 0xb4,
    SetRelays = 0xb5,
    SetVoltDivCh1 = 0xe0,
    SetVoltDivCh2 = 0xe1,
    SetTimeDiv = 0xe2,
    AcquireHardData = 0xe3,
}

/// Value words for `ControlCode::Value` reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ControlValue {
    /// Factory offset calibration table, 2 channels x 9 gains x 2 big-endian
    /// u16 (start, end).
    OffsetLimits = 0x08,
}

/// Capture state byte of the `GetCaptureState` response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CaptureState {
    Waiting = 0,
    Sampling = 1,
    Ready = 2,
    Ready2250 = 3,
    Ready5200 = 7,
}

impl CaptureState {
    pub fn from_raw(raw: u8) -> Option<CaptureState> {
        match raw {
            0 => Some(CaptureState::Waiting),
            1 => Some(CaptureState::Sampling),
            2 => Some(CaptureState::Ready),
            3 => Some(CaptureState::Ready2250),
            7 => Some(CaptureState::Ready5200),
            _ => None,
        }
    }

    pub fn is_ready(self) -> bool {
        matches!(self, CaptureState::Ready | CaptureState::Ready2250 | CaptureState::Ready5200)
    }
}

// Values of the used-channels command field.
pub const USED_CH1: u8 = 0x00;
pub const USED_CH2: u8 = 0x01;
pub const USED_CH1CH2: u8 = 0x02;
/// The DSO-2250 uses a different value for a lone CH2.
pub const BUSED_CH2: u8 = 0x03;

/// "Trigger position used" marker in the 5200 buffer command.
pub const DTRIGGERPOSITION_ON: u8 = 0x07;

/// `GetCaptureState` response frame.
pub struct CaptureStateResponse(pub [u8; 512]);

impl CaptureStateResponse {
    pub fn new() -> Self {
        CaptureStateResponse([0; 512])
    }

    pub fn capture_state(&self) -> u8 {
        self.0[0]
    }

    /// Raw trigger point, still folded in the device's bit encoding.
    pub fn trigger_point(&self) -> u16 {
        u16::from_le_bytes([self.0[2], self.0[3]])
    }
}

fn set_bit(byte: &mut u8, mask: u8, on: bool) {
    if on {
        *byte |= mask;
    } else {
        *byte &= !mask;
    }
}

macro_rules! frame {
    ($name:ident, $size:literal, $code:expr) => {
        #[derive(Debug, Clone)]
        pub struct $name([u8; $size]);

        impl $name {
            pub fn new() -> Self {
                let mut raw = [0u8; $size];
                raw[0] = $code as u8;
                $name(raw)
            }

            pub fn data(&self) -> &[u8] {
                &self.0
            }

            pub fn data_mut(&mut self) -> &mut [u8] {
                &mut self.0
            }
        }
    };
}

// Plain two-byte commands without payload fields.
frame!(ForceTrigger, 2, BulkCode::ForceTrigger);
frame!(StartSampling, 2, BulkCode::StartSampling);
frame!(EnableTrigger, 2, BulkCode::EnableTrigger);
frame!(GetData, 2, BulkCode::GetData);
frame!(GetCaptureState, 2, BulkCode::GetCaptureState);

#[derive(Debug, Clone)]
pub struct SetGain([u8; 8]);

impl SetGain {
    pub fn new() -> Self {
        let mut raw = [0u8; 8];
        raw[0] = BulkCode::SetGain as u8;
        raw[1] = 0x0f;
        SetGain(raw)
    }

    pub fn data(&self) -> &[u8] {
        &self.0
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.0
    }

    /// Gain index for one channel, two bits per channel.
    pub fn set_gain(&mut self, channel: usize, index: u8) {
        let shift = (channel as u8) * 2;
        self.0[2] = self.0[2] & !(0x03 << shift) | (index & 0x03) << shift;
    }

    pub fn gain(&self, channel: usize) -> u8 {
        (self.0[2] >> (channel as u8 * 2)) & 0x03
    }
}

// The DSO-2090 megacommand: record length, channels, samplerate, trigger and
// pretrigger position all share this one frame.
frame!(SetTriggerAndSamplerate, 12, BulkCode::SetTriggerAndSamplerate);

impl SetTriggerAndSamplerate {
    pub fn set_trigger_source(&mut self, source: u8) {
        self.0[2] = self.0[2] & !0x03 | source & 0x03;
    }

    pub fn trigger_source(&self) -> u8 {
        self.0[2] & 0x03
    }

    pub fn set_record_length(&mut self, id: u8) {
        self.0[2] = self.0[2] & !0x1c | (id << 2) & 0x1c;
    }

    pub fn record_length(&self) -> u8 {
        (self.0[2] >> 2) & 0x07
    }

    pub fn set_samplerate_id(&mut self, id: u8) {
        self.0[2] = self.0[2] & !0x60 | (id << 5) & 0x60;
    }

    pub fn samplerate_id(&self) -> u8 {
        (self.0[2] >> 5) & 0x03
    }

    pub fn set_downsampling_mode(&mut self, on: bool) {
        set_bit(&mut self.0[2], 0x80, on);
    }

    pub fn downsampling_mode(&self) -> bool {
        self.0[2] & 0x80 != 0
    }

    pub fn set_used_channels(&mut self, used: u8) {
        self.0[3] = self.0[3] & !0x03 | used & 0x03;
    }

    pub fn used_channels(&self) -> u8 {
        self.0[3] & 0x03
    }

    pub fn set_fast_rate(&mut self, on: bool) {
        set_bit(&mut self.0[3], 0x04, on);
    }

    pub fn fast_rate(&self) -> bool {
        self.0[3] & 0x04 != 0
    }

    pub fn set_trigger_slope(&mut self, slope: u8) {
        set_bit(&mut self.0[3], 0x08, slope != 0);
    }

    pub fn trigger_slope(&self) -> u8 {
        (self.0[3] >> 3) & 0x01
    }

    pub fn set_downsampler(&mut self, value: u16) {
        self.0[4..6].copy_from_slice(&value.to_le_bytes());
    }

    pub fn downsampler(&self) -> u16 {
        u16::from_le_bytes([self.0[4], self.0[5]])
    }

    /// Pretrigger position in the 0x7ffff address space.
    pub fn set_trigger_position(&mut self, position: u32) {
        self.0[6] = position as u8;
        self.0[7] = (position >> 8) as u8;
        self.0[8] = (position >> 16) as u8;
    }

    pub fn trigger_position(&self) -> u32 {
        self.0[6] as u32 | (self.0[7] as u32) << 8 | (self.0[8] as u32) << 16
    }
}

frame!(SetChannels2250, 4, BulkCode::BSetChannels);

impl SetChannels2250 {
    pub fn set_used_channels(&mut self, used: u8) {
        self.0[2] = used;
    }

    pub fn used_channels(&self) -> u8 {
        self.0[2]
    }
}

frame!(SetTrigger2250, 8, BulkCode::CSetTriggerOrSamplerate);

impl SetTrigger2250 {
    pub fn set_trigger_source(&mut self, source: u8) {
        self.0[2] = self.0[2] & !0x07 | source & 0x07;
    }

    pub fn trigger_source(&self) -> u8 {
        self.0[2] & 0x07
    }

    pub fn set_trigger_slope(&mut self, slope: u8) {
        set_bit(&mut self.0[3], 0x01, slope != 0);
    }

    pub fn trigger_slope(&self) -> u8 {
        self.0[3] & 0x01
    }
}

frame!(SetSamplerate5200, 6, BulkCode::CSetTriggerOrSamplerate);

impl SetSamplerate5200 {
    pub fn set_samplerate_slow(&mut self, value: u16) {
        self.0[2..4].copy_from_slice(&value.to_le_bytes());
    }

    pub fn samplerate_slow(&self) -> u16 {
        u16::from_le_bytes([self.0[2], self.0[3]])
    }

    pub fn set_samplerate_fast(&mut self, value: u8) {
        self.0[4] = self.0[4] & !0x07 | value & 0x07;
    }

    pub fn samplerate_fast(&self) -> u8 {
        self.0[4] & 0x07
    }
}

frame!(SetRecordLength2250, 4, BulkCode::DSetBuffer);

impl SetRecordLength2250 {
    pub fn set_record_length(&mut self, id: u8) {
        self.0[2] = id;
    }

    pub fn record_length(&self) -> u8 {
        self.0[2]
    }
}

frame!(SetBuffer5200, 10, BulkCode::DSetBuffer);

impl SetBuffer5200 {
    /// Pretrigger position, inverted into the 0xffff space by the caller.
    pub fn set_trigger_position_pre(&mut self, position: u16) {
        self.0[2..4].copy_from_slice(&position.to_le_bytes());
    }

    pub fn trigger_position_pre(&self) -> u16 {
        u16::from_le_bytes([self.0[2], self.0[3]])
    }

    pub fn set_used_pre(&mut self, value: u8) {
        self.0[4] = self.0[4] & !0x07 | value & 0x07;
    }

    pub fn set_record_length(&mut self, id: u8) {
        self.0[5] = id;
    }

    pub fn record_length(&self) -> u8 {
        self.0[5]
    }

    pub fn set_trigger_position_post(&mut self, position: u16) {
        self.0[6..8].copy_from_slice(&position.to_le_bytes());
    }

    pub fn trigger_position_post(&self) -> u16 {
        u16::from_le_bytes([self.0[6], self.0[7]])
    }

    pub fn set_used_post(&mut self, value: u8) {
        self.0[8] = self.0[8] & !0x07 | value & 0x07;
    }
}

frame!(SetSamplerate2250, 8, BulkCode::ESetTriggerOrSamplerate);

impl SetSamplerate2250 {
    pub fn set_fast_rate(&mut self, on: bool) {
        set_bit(&mut self.0[2], 0x01, on);
    }

    pub fn fast_rate(&self) -> bool {
        self.0[2] & 0x01 != 0
    }

    pub fn set_downsampling(&mut self, on: bool) {
        set_bit(&mut self.0[2], 0x02, on);
    }

    pub fn downsampling(&self) -> bool {
        self.0[2] & 0x02 != 0
    }

    /// Downsampler word, stored as `0x10001 - d` by the caller for d > 1.
    pub fn set_samplerate(&mut self, value: u16) {
        self.0[4..6].copy_from_slice(&value.to_le_bytes());
    }

    pub fn samplerate(&self) -> u16 {
        u16::from_le_bytes([self.0[4], self.0[5]])
    }
}

frame!(SetTrigger5200, 8, BulkCode::ESetTriggerOrSamplerate);

impl SetTrigger5200 {
    pub fn set_trigger_source(&mut self, source: u8) {
        self.0[2] = self.0[2] & !0x07 | source & 0x07;
    }

    pub fn trigger_source(&self) -> u8 {
        self.0[2] & 0x07
    }

    pub fn set_used_channels(&mut self, used: u8) {
        self.0[3] = self.0[3] & !0x03 | used & 0x03;
    }

    pub fn used_channels(&self) -> u8 {
        self.0[3] & 0x03
    }

    pub fn set_fast_rate(&mut self, on: bool) {
        set_bit(&mut self.0[3], 0x04, on);
    }

    pub fn fast_rate(&self) -> bool {
        self.0[3] & 0x04 != 0
    }

    pub fn set_trigger_slope(&mut self, slope: u8) {
        set_bit(&mut self.0[3], 0x08, slope != 0);
    }

    pub fn trigger_slope(&self) -> u8 {
        (self.0[3] >> 3) & 0x01
    }
}

frame!(SetBuffer2250, 12, BulkCode::FSetBuffer);

impl SetBuffer2250 {
    /// Pretrigger position, inverted into the 0x7ffff space by the caller.
    pub fn set_trigger_position_pre(&mut self, position: u32) {
        self.0[2] = position as u8;
        self.0[3] = (position >> 8) as u8;
        self.0[4] = (position >> 16) as u8;
    }

    pub fn trigger_position_pre(&self) -> u32 {
        self.0[2] as u32 | (self.0[3] as u32) << 8 | (self.0[4] as u32) << 16
    }

    pub fn set_trigger_position_post(&mut self, position: u32) {
        self.0[6] = position as u8;
        self.0[7] = (position >> 8) as u8;
        self.0[8] = (position >> 16) as u8;
    }

    pub fn trigger_position_post(&self) -> u32 {
        self.0[6] as u32 | (self.0[7] as u32) << 8 | (self.0[8] as u32) << 16
    }
}

/// One allocated bulk command slot. The discriminant is fixed at init time
/// per model, which keeps cross-model field writes unrepresentable.
#[derive(Debug, Clone)]
pub enum BulkCommand {
    ForceTrigger(ForceTrigger),
    StartSampling(StartSampling),
    EnableTrigger(EnableTrigger),
    GetData(GetData),
    GetCaptureState(GetCaptureState),
    SetGain(SetGain),
    SetTriggerAndSamplerate(SetTriggerAndSamplerate),
    SetChannels2250(SetChannels2250),
    SetTrigger2250(SetTrigger2250),
    SetSamplerate5200(SetSamplerate5200),
    SetRecordLength2250(SetRecordLength2250),
    SetBuffer5200(SetBuffer5200),
    SetSamplerate2250(SetSamplerate2250),
    SetTrigger5200(SetTrigger5200),
    SetBuffer2250(SetBuffer2250),
}

impl BulkCommand {
    pub fn data(&self) -> &[u8] {
        match self {
            Self::ForceTrigger(cmd) => cmd.data(),
            Self::StartSampling(cmd) => cmd.data(),
            Self::EnableTrigger(cmd) => cmd.data(),
            Self::GetData(cmd) => cmd.data(),
            Self::GetCaptureState(cmd) => cmd.data(),
            Self::SetGain(cmd) => cmd.data(),
            Self::SetTriggerAndSamplerate(cmd) => cmd.data(),
            Self::SetChannels2250(cmd) => cmd.data(),
            Self::SetTrigger2250(cmd) => cmd.data(),
            Self::SetSamplerate5200(cmd) => cmd.data(),
            Self::SetRecordLength2250(cmd) => cmd.data(),
            Self::SetBuffer5200(cmd) => cmd.data(),
            Self::SetSamplerate2250(cmd) => cmd.data(),
            Self::SetTrigger5200(cmd) => cmd.data(),
            Self::SetBuffer2250(cmd) => cmd.data(),
        }
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        match self {
            Self::ForceTrigger(cmd) => cmd.data_mut(),
            Self::StartSampling(cmd) => cmd.data_mut(),
            Self::EnableTrigger(cmd) => cmd.data_mut(),
            Self::GetData(cmd) => cmd.data_mut(),
            Self::GetCaptureState(cmd) => cmd.data_mut(),
            Self::SetGain(cmd) => cmd.data_mut(),
            Self::SetTriggerAndSamplerate(cmd) => cmd.data_mut(),
            Self::SetChannels2250(cmd) => cmd.data_mut(),
            Self::SetTrigger2250(cmd) => cmd.data_mut(),
            Self::SetSamplerate5200(cmd) => cmd.data_mut(),
            Self::SetRecordLength2250(cmd) => cmd.data_mut(),
            Self::SetBuffer5200(cmd) => cmd.data_mut(),
            Self::SetSamplerate2250(cmd) => cmd.data_mut(),
            Self::SetTrigger5200(cmd) => cmd.data_mut(),
            Self::SetBuffer2250(cmd) => cmd.data_mut(),
        }
    }
}

// Control command frames.

#[derive(Debug, Clone)]
pub struct SetOffset([u8; 17]);

impl SetOffset {
    pub fn new() -> Self {
        SetOffset([0; 17])
    }

    /// Quantised offset for one channel, big-endian on the wire.
    pub fn set_channel(&mut self, channel: usize, offset: u16) {
        self.0[channel * 2..channel * 2 + 2].copy_from_slice(&offset.to_be_bytes());
    }

    pub fn channel(&self, channel: usize) -> u16 {
        u16::from_be_bytes([self.0[channel * 2], self.0[channel * 2 + 1]])
    }

    /// Trigger level, big-endian on the wire.
    pub fn set_trigger(&mut self, level: u16) {
        self.0[4..6].copy_from_slice(&level.to_be_bytes());
    }

    pub fn trigger(&self) -> u16 {
        u16::from_be_bytes([self.0[4], self.0[5]])
    }

    pub fn data(&self) -> &[u8] {
        &self.0
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.0
    }
}

// Relay state bytes: the byte holds the mask when the relay is energised and
// the complement otherwise.
const RELAY_BELOW_1V: [(usize, u8); 2] = [(1, 0x04), (4, 0x20)];
const RELAY_BELOW_100MV: [(usize, u8); 2] = [(2, 0x08), (5, 0x40)];
const RELAY_COUPLING_DC: [(usize, u8); 2] = [(3, 0x02), (6, 0x10)];
const RELAY_TRIGGER_EXT: (usize, u8) = (7, 0x01);

#[derive(Debug, Clone)]
pub struct SetRelays([u8; 17]);

impl SetRelays {
    pub fn new() -> Self {
        let mut relays = SetRelays([0; 17]);
        for channel in 0..2 {
            relays.set_below_1v(channel, false);
            relays.set_below_100mv(channel, false);
            relays.set_coupling(channel, true);
        }
        relays.set_trigger(false);
        relays
    }

    fn set_relay(&mut self, (index, mask): (usize, u8), on: bool) {
        self.0[index] = if on { mask } else { !mask };
    }

    pub fn set_below_1v(&mut self, channel: usize, on: bool) {
        self.set_relay(RELAY_BELOW_1V[channel], on);
    }

    pub fn below_1v(&self, channel: usize) -> bool {
        self.0[RELAY_BELOW_1V[channel].0] == RELAY_BELOW_1V[channel].1
    }

    pub fn set_below_100mv(&mut self, channel: usize, on: bool) {
        self.set_relay(RELAY_BELOW_100MV[channel], on);
    }

    pub fn below_100mv(&self, channel: usize) -> bool {
        self.0[RELAY_BELOW_100MV[channel].0] == RELAY_BELOW_100MV[channel].1
    }

    pub fn set_coupling(&mut self, channel: usize, dc: bool) {
        self.set_relay(RELAY_COUPLING_DC[channel], dc);
    }

    pub fn coupling_dc(&self, channel: usize) -> bool {
        self.0[RELAY_COUPLING_DC[channel].0] == RELAY_COUPLING_DC[channel].1
    }

    pub fn set_trigger(&mut self, ext: bool) {
        self.set_relay(RELAY_TRIGGER_EXT, ext);
    }

    pub fn trigger_ext(&self) -> bool {
        self.0[RELAY_TRIGGER_EXT.0] == RELAY_TRIGGER_EXT.1
    }

    pub fn data(&self) -> &[u8] {
        &self.0
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.0
    }
}

/// Single-byte divider frame shared by the 6022BE voltage and time divider
/// requests.
#[derive(Debug, Clone)]
pub struct SetDiv([u8; 1]);

impl SetDiv {
    pub fn new() -> Self {
        SetDiv([0; 1])
    }

    pub fn set_div(&mut self, div: u8) {
        self.0[0] = div;
    }

    pub fn div(&self) -> u8 {
        self.0[0]
    }

    pub fn data(&self) -> &[u8] {
        &self.0
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.0
    }
}

#[derive(Debug, Clone)]
pub struct AcquireHardData([u8; 1]);

impl AcquireHardData {
    pub fn new() -> Self {
        AcquireHardData([0x01])
    }

    pub fn data(&self) -> &[u8] {
        &self.0
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.0
    }
}

/// Control command slot indices, flushed in this order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum ControlIndex {
    SetOffset = 0,
    SetRelays = 1,
    VoltDivCh1 = 2,
    VoltDivCh2 = 3,
    TimeDiv = 4,
    AcquireHardData = 5,
}

impl ControlIndex {
    pub const COUNT: usize = 6;
}

#[derive(Debug, Clone)]
pub enum ControlCommand {
    SetOffset(SetOffset),
    SetRelays(SetRelays),
    VoltDivCh1(SetDiv),
    VoltDivCh2(SetDiv),
    TimeDiv(SetDiv),
    AcquireHardData(AcquireHardData),
}

impl ControlCommand {
    pub fn code(&self) -> ControlCode {
        match self {
            Self::SetOffset(_) => ControlCode::SetOffset,
            Self::SetRelays(_) => ControlCode::SetRelays,
            Self::VoltDivCh1(_) => ControlCode::SetVoltDivCh1,
            Self::VoltDivCh2(_) => ControlCode::SetVoltDivCh2,
            Self::TimeDiv(_) => ControlCode::SetTimeDiv,
            Self::AcquireHardData(_) => ControlCode::AcquireHardData,
        }
    }

    pub fn data(&self) -> &[u8] {
        match self {
            Self::SetOffset(cmd) => cmd.data(),
            Self::SetRelays(cmd) => cmd.data(),
            Self::VoltDivCh1(cmd) => cmd.data(),
            Self::VoltDivCh2(cmd) => cmd.data(),
            Self::TimeDiv(cmd) => cmd.data(),
            Self::AcquireHardData(cmd) => cmd.data(),
        }
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        match self {
            Self::SetOffset(cmd) => cmd.data_mut(),
            Self::SetRelays(cmd) => cmd.data_mut(),
            Self::VoltDivCh1(cmd) => cmd.data_mut(),
            Self::VoltDivCh2(cmd) => cmd.data_mut(),
            Self::TimeDiv(cmd) => cmd.data_mut(),
            Self::AcquireHardData(cmd) => cmd.data_mut(),
        }
    }
}

/// Parse whitespace-separated hex digit pairs into `data`, returning the
/// number of bytes written. Used by the diagnostic string commands.
pub fn hex_parse(text: &str, data: &mut [u8]) -> usize {
    let mut digits = text.chars().filter_map(|c| c.to_digit(16));
    let mut count = 0;
    while count < data.len() {
        let (high, low) = match (digits.next(), digits.next()) {
            (Some(high), Some(low)) => (high, low),
            _ => break,
        };
        data[count] = (high << 4 | low) as u8;
        count += 1;
    }
    count
}
