//! Simulated register device.
//!
//! Backs `--simulate` and the test suite. A [`SimDevice`] is a shared handle
//! on the register banks; every [`SimTransport`] created from it sees the same
//! state, so tests can change registers or inject faults while the scheduler
//! is polling.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::error::TransportError;
use crate::registers::{self, RegisterKind};
use crate::transport::RegisterTransport;

/// How the simulated device reacts to writes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Behaviour {
    /// Writes land in the holding bank and nothing else changes.
    #[default]
    Registers,
    /// Power and frequency writes show up in the input registers.
    Cryomech,
    /// Frequency setpoint writes show up in the output frequency.
    Inverter,
}

#[derive(Debug, Default)]
struct SimState {
    input: HashMap<u16, u16>,
    holding: HashMap<u16, u16>,
    behaviour: Behaviour,
    connected: bool,
    offline: bool,
    fail_next: usize,
    reject_writes: bool,
    rejected_addresses: HashSet<u16>,
    latency: Duration,
    connects: usize,
    closes: usize,
    reads: usize,
    writes: Vec<(u16, u16)>,
}

/// Shared handle on a simulated device.
#[derive(Debug, Clone, Default)]
pub struct SimDevice {
    state: Arc<Mutex<SimState>>,
}

impl SimDevice {
    /// A device with empty register banks. Unset registers read as 0.
    pub fn new() -> Self {
        Self::default()
    }

    /// A running CPA28I6 panel with software revision 3.1.
    pub fn cryomech_v3() -> Self {
        let device = Self::new().with_behaviour(Behaviour::Cryomech);
        device
            .set_input(registers::SERIAL_ADDR, 4242)
            .set_input(registers::MODEL_ADDR, 0x050B)
            .set_input(registers::SOFTWARE_REV_ADDR, 0x0301)
            .set_input(registers::PRESSURE_SCALE_ADDR, 0)
            .set_input(registers::TEMPERATURE_SCALE_ADDR, 0)
            .set_input(1, 3)
            .set_input(2, 1)
            .set_input_i32(52, 0)
            .set_input_i32(54, 0)
            .set_input(34, 7200)
            .set_input(35, 1)
            .set_input(36, 600)
            .set_input(37, 152)
            .set_input(40, 652)
            .set_input(41, 851)
            .set_input(42, 903)
            .set_input(43, 1487)
            .set_input(44, 752)
            .set_input(45, 748)
            .set_input(46, 2903)
            .set_input(47, 2897)
            .set_input(48, 2149)
            .set_input(49, 102)
            .set_input_i32(50, 123_456)
            .set_holding(registers::ENABLE_ADDR, registers::POWER_ON)
            .set_holding(3, 600);
        device
    }

    /// A running CPA1110 panel with software revision 2.10.
    pub fn cryomech_v2() -> Self {
        let device = Self::new().with_behaviour(Behaviour::Cryomech);
        device
            .set_input(registers::SERIAL_ADDR, 1717)
            .set_input(registers::MODEL_ADDR, 0x0303)
            .set_input(registers::SOFTWARE_REV_ADDR, 0x020A)
            .set_input(registers::PRESSURE_SCALE_ADDR, 0)
            .set_input(registers::TEMPERATURE_SCALE_ADDR, 0)
            .set_input(1, 3)
            .set_input(2, 1)
            .set_input_f32(3, 0.0)
            .set_input_f32(5, 0.0)
            .set_input_f32(7, 65.2)
            .set_input_f32(9, 85.1)
            .set_input_f32(11, 90.3)
            .set_input_f32(13, 148.7)
            .set_input_f32(15, 75.2)
            .set_input_f32(17, 74.8)
            .set_input_f32(19, 290.3)
            .set_input_f32(21, 289.7)
            .set_input_f32(23, 214.9)
            .set_input_f32(25, 10.2)
            .set_input_f32(27, 12_345.6)
            .set_holding(registers::ENABLE_ADDR, registers::POWER_ON);
        device
    }

    /// An RS485 drive inverter running at 60 Hz.
    pub fn external_inverter() -> Self {
        let device = Self::new().with_behaviour(Behaviour::Inverter);
        device
            .set_holding_i32(0x1001, 6000)
            .set_holding(0x1010, 2300)
            .set_holding(0x1011, 25)
            .set_holding_i32(0x0001, 6000);
        device
    }

    pub fn with_behaviour(self, behaviour: Behaviour) -> Self {
        self.lock().behaviour = behaviour;
        self
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        // A panicking test thread must not take the rest of the suite down.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// A transport connected to this device.
    pub fn transport(&self) -> SimTransport {
        SimTransport {
            device: self.clone(),
        }
    }

    pub fn set_input(&self, address: u16, value: u16) -> &Self {
        self.lock().input.insert(address, value);
        self
    }

    pub fn set_input_i16(&self, address: u16, value: i16) -> &Self {
        self.set_input(address, value as u16)
    }

    /// Two registers, low word first.
    pub fn set_input_i32(&self, address: u16, value: i32) -> &Self {
        let bits = value as u32;
        self.set_input(address, bits as u16)
            .set_input(address + 1, (bits >> 16) as u16)
    }

    /// Two registers, low word first.
    pub fn set_input_f32(&self, address: u16, value: f32) -> &Self {
        let bits = value.to_bits();
        self.set_input(address, bits as u16)
            .set_input(address + 1, (bits >> 16) as u16)
    }

    pub fn set_holding(&self, address: u16, value: u16) -> &Self {
        self.lock().holding.insert(address, value);
        self
    }

    pub fn set_holding_i32(&self, address: u16, value: i32) -> &Self {
        let bits = value as u32;
        self.set_holding(address, bits as u16)
            .set_holding(address + 1, (bits >> 16) as u16)
    }

    pub fn input(&self, address: u16) -> u16 {
        self.lock().input.get(&address).copied().unwrap_or(0)
    }

    pub fn holding(&self, address: u16) -> u16 {
        self.lock().holding.get(&address).copied().unwrap_or(0)
    }

    /// Refuse connections and fail every operation until set back.
    pub fn set_offline(&self, offline: bool) {
        let mut state = self.lock();
        state.offline = offline;
        if offline {
            state.connected = false;
        }
    }

    /// Fail the next `n` reads or writes with a connection fault.
    pub fn fail_next(&self, n: usize) {
        self.lock().fail_next = n;
    }

    /// Answer every write with an exception response.
    pub fn reject_writes(&self, reject: bool) {
        self.lock().reject_writes = reject;
    }

    /// Answer writes to one address with an exception response.
    pub fn reject_writes_to(&self, address: u16) {
        self.lock().rejected_addresses.insert(address);
    }

    /// Delay every read by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.lock().latency = latency;
    }

    pub fn is_connected(&self) -> bool {
        self.lock().connected
    }

    pub fn connect_count(&self) -> usize {
        self.lock().connects
    }

    pub fn close_count(&self) -> usize {
        self.lock().closes
    }

    pub fn read_count(&self) -> usize {
        self.lock().reads
    }

    /// Every accepted write, in order.
    pub fn writes(&self) -> Vec<(u16, u16)> {
        self.lock().writes.clone()
    }

    fn check_online(state: &mut SimState) -> Result<(), TransportError> {
        if state.offline {
            state.connected = false;
            return Err(TransportError::Connection("simulated device offline".into()));
        }
        if !state.connected {
            return Err(TransportError::NotConnected);
        }
        if state.fail_next > 0 {
            state.fail_next -= 1;
            return Err(TransportError::Connection("simulated link fault".into()));
        }
        Ok(())
    }

    fn apply_write(state: &mut SimState, address: u16, value: u16) {
        state.holding.insert(address, value);
        match (state.behaviour, address) {
            (Behaviour::Cryomech, registers::ENABLE_ADDR) => {
                let (run_state, enabled) = if value == registers::POWER_ON {
                    (3, 1)
                } else {
                    (0, 0)
                };
                state.input.insert(1, run_state);
                state.input.insert(2, enabled);
            }
            (Behaviour::Cryomech, 3) => {
                state.input.insert(36, value);
            }
            (Behaviour::Inverter, 0x0001) => {
                state.holding.insert(0x0002, 0);
                state.holding.insert(0x1001, value);
                state.holding.insert(0x1002, 0);
            }
            _ => {}
        }
    }
}

/// [`RegisterTransport`] over a [`SimDevice`].
#[derive(Debug, Clone)]
pub struct SimTransport {
    device: SimDevice,
}

impl SimTransport {
    pub fn device(&self) -> &SimDevice {
        &self.device
    }
}

impl RegisterTransport for SimTransport {
    async fn connect(&mut self) -> Result<(), TransportError> {
        let mut state = self.device.lock();
        state.connects += 1;
        if state.offline {
            return Err(TransportError::Connection("simulated device offline".into()));
        }
        state.connected = true;
        Ok(())
    }

    async fn read_registers(
        &mut self,
        kind: RegisterKind,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, TransportError> {
        let latency = self.device.lock().latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.device.lock();
        SimDevice::check_online(&mut state)?;
        state.reads += 1;

        let bank = match kind {
            RegisterKind::Input => &state.input,
            RegisterKind::Holding => &state.holding,
        };
        Ok((address..address.saturating_add(count))
            .map(|addr| bank.get(&addr).copied().unwrap_or(0))
            .collect())
    }

    async fn write_register(&mut self, address: u16, value: u16) -> Result<(), TransportError> {
        let mut state = self.device.lock();
        SimDevice::check_online(&mut state)?;

        if state.reject_writes || state.rejected_addresses.contains(&address) {
            return Err(TransportError::Rejected("IllegalDataValue".into()));
        }

        state.writes.push((address, value));
        SimDevice::apply_write(&mut state, address, value);
        Ok(())
    }

    async fn close(&mut self) {
        let mut state = self.device.lock();
        if state.connected {
            state.connected = false;
            state.closes += 1;
        }
    }

    fn is_connected(&self) -> bool {
        self.device.is_connected()
    }

    fn endpoint(&self) -> String {
        "simulated".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_requires_connect() {
        let device = SimDevice::cryomech_v3();
        let mut transport = device.transport();

        assert_eq!(
            transport.read_registers(RegisterKind::Input, 1, 1).await,
            Err(TransportError::NotConnected)
        );

        transport.connect().await.unwrap();
        assert_eq!(
            transport.read_registers(RegisterKind::Input, 1, 2).await,
            Ok(vec![3, 1])
        );
        assert_eq!(device.read_count(), 1);
    }

    #[tokio::test]
    async fn test_power_write_changes_state() {
        let device = SimDevice::cryomech_v3();
        let mut transport = device.transport();
        transport.connect().await.unwrap();

        transport
            .write_register(registers::ENABLE_ADDR, registers::POWER_OFF)
            .await
            .unwrap();

        assert_eq!(device.input(1), 0);
        assert_eq!(device.input(2), 0);
        assert_eq!(device.writes(), vec![(1, 0x00FF)]);
    }

    #[tokio::test]
    async fn test_injected_faults() {
        let device = SimDevice::new();
        let mut transport = device.transport();
        transport.connect().await.unwrap();

        device.fail_next(1);
        assert!(transport.read_registers(RegisterKind::Input, 1, 1).await.is_err());
        assert!(transport.read_registers(RegisterKind::Input, 1, 1).await.is_ok());

        device.reject_writes_to(3);
        assert!(matches!(
            transport.write_register(3, 500).await,
            Err(TransportError::Rejected(_))
        ));
        assert_eq!(device.holding(3), 0);
    }

    #[tokio::test]
    async fn test_offline_refuses_connect() {
        let device = SimDevice::new();
        device.set_offline(true);
        let mut transport = device.transport();

        assert!(transport.connect().await.is_err());
        assert_eq!(device.connect_count(), 1);
        assert!(!device.is_connected());
    }

    #[tokio::test]
    async fn test_close_counts_once() {
        let device = SimDevice::new();
        let mut transport = device.transport();
        transport.connect().await.unwrap();
        transport.close().await;
        transport.close().await;
        assert_eq!(device.close_count(), 1);
    }
}
