use serde::Serialize;

/// Minimum size of an energy meter datagram.
pub const MIN_FRAME_LEN: usize = 600;

const MAGIC: &[u8; 3] = b"SMA";
const PROTOCOL_OFFSET: usize = 16;
const PROTOCOL_EMETER: u16 = 0x6069;

// watts * 10, lower half of the 4 byte OBIS values
const TOTAL_FROM_GRID: usize = 34;
const TOTAL_TO_GRID: usize = 54;
const PHASE1_FROM_GRID: usize = 170;
const PHASE1_TO_GRID: usize = 190;
const PHASE2_FROM_GRID: usize = 314;
const PHASE2_TO_GRID: usize = 334;
const PHASE3_FROM_GRID: usize = 458;
const PHASE3_TO_GRID: usize = 478;

// watt seconds, 8 byte counters
const ENERGY_FROM_GRID: usize = 40;
const ENERGY_TO_GRID: usize = 60;

/// Grid readings carried by one Home Manager / Energy Meter broadcast.
///
/// Power values are in W, energy counters in kWh.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastFrame {
    pub total_power_from_grid: f64,
    pub total_power_to_grid: f64,
    pub phase1_power_from_grid: f64,
    pub phase1_power_to_grid: f64,
    pub phase2_power_from_grid: f64,
    pub phase2_power_to_grid: f64,
    pub phase3_power_from_grid: f64,
    pub phase3_power_to_grid: f64,
    pub total_energy_from_grid: f64,
    pub total_energy_to_grid: f64,
}

fn power(datagram: &[u8], offset: usize) -> f64 {
    f64::from(u16::from_be_bytes([datagram[offset], datagram[offset + 1]])) / 10.
}

fn energy(datagram: &[u8], offset: usize) -> f64 {
    let mut raw = [0_u8; 8];
    raw.copy_from_slice(&datagram[offset..offset + 8]);
    u64::from_be_bytes(raw) as f64 / 3_600_000.
}

impl BroadcastFrame {
    /// Parses a received datagram.
    ///
    /// Other senders share the multicast group, so anything that is not an
    /// energy meter frame yields `None`.
    pub fn parse(datagram: &[u8]) -> Option<Self> {
        if datagram.len() < MIN_FRAME_LEN || !datagram.starts_with(MAGIC) {
            return None;
        }
        let protocol = u16::from_be_bytes([
            datagram[PROTOCOL_OFFSET],
            datagram[PROTOCOL_OFFSET + 1],
        ]);
        if protocol != PROTOCOL_EMETER {
            return None;
        }

        Some(Self {
            total_power_from_grid: power(datagram, TOTAL_FROM_GRID),
            total_power_to_grid: power(datagram, TOTAL_TO_GRID),
            phase1_power_from_grid: power(datagram, PHASE1_FROM_GRID),
            phase1_power_to_grid: power(datagram, PHASE1_TO_GRID),
            phase2_power_from_grid: power(datagram, PHASE2_FROM_GRID),
            phase2_power_to_grid: power(datagram, PHASE2_TO_GRID),
            phase3_power_from_grid: power(datagram, PHASE3_FROM_GRID),
            phase3_power_to_grid: power(datagram, PHASE3_TO_GRID),
            total_energy_from_grid: energy(datagram, ENERGY_FROM_GRID),
            total_energy_to_grid: energy(datagram, ENERGY_TO_GRID),
        })
    }

    /// Field name / value pairs in publishing order.
    pub fn fields(&self) -> [(&'static str, f64); 10] {
        [
            ("totalPowerFromGrid", self.total_power_from_grid),
            ("totalPowerToGrid", self.total_power_to_grid),
            ("phase1PowerFromGrid", self.phase1_power_from_grid),
            ("phase1PowerToGrid", self.phase1_power_to_grid),
            ("phase2PowerFromGrid", self.phase2_power_from_grid),
            ("phase2PowerToGrid", self.phase2_power_to_grid),
            ("phase3PowerFromGrid", self.phase3_power_from_grid),
            ("phase3PowerToGrid", self.phase3_power_to_grid),
            ("totalEnergyFromGrid", self.total_energy_from_grid),
            ("totalEnergyToGrid", self.total_energy_to_grid),
        ]
    }
}

/// Builds a datagram the way an energy meter lays it out. Test helper.
#[cfg(test)]
pub(crate) fn sample_datagram(power: &[(usize, u16)]) -> Vec<u8> {
    let mut datagram = vec![0_u8; MIN_FRAME_LEN];
    datagram[..4].copy_from_slice(b"SMA\0");
    datagram[PROTOCOL_OFFSET..PROTOCOL_OFFSET + 2].copy_from_slice(&PROTOCOL_EMETER.to_be_bytes());
    for (offset, value) in power {
        datagram[*offset..*offset + 2].copy_from_slice(&value.to_be_bytes());
    }
    datagram
}
