use crate::models::Reading;
use anyhow::{Context, anyhow, bail};
use arbitrary_int::*;
use bitbybit::bitfield;
use embedded_hal::delay::DelayNs;
use embedded_hal::i2c::I2c;
use log::{debug, info};

pub(crate) const I2C_ADDR_PRIMARY: u8 = 0x76;
pub(crate) const I2C_ADDR_SECONDARY: u8 = 0x77;
const CHIP_ID: u8 = 0x61;
const SOFT_RESET_CMD: u8 = 0xB6;
const FIELD_LENGTH: usize = 15;
const COEFF_1_LENGTH: usize = 25;
const COEFF_2_LENGTH: usize = 16;
const POLL_ATTEMPTS: u32 = 10;
const POLL_PERIOD_MS: u32 = 10;
const AMBIENT_TEMPERATURE: f32 = 25.0;
const MAX_HEATER_TEMPERATURE: f32 = 400.0;

const GAS_RANGE_K1: [f32; 16] = [
    1.0, 1.0, 1.0, 1.0, 1.0, 0.99, 1.0, 0.992, 1.0, 1.0, 0.998, 0.995, 1.0, 0.99, 1.0, 1.0,
];
const GAS_RANGE_K2: [f32; 16] = [
    8000000.0,
    4000000.0,
    2000000.0,
    1000000.0,
    499500.4995,
    248262.1648,
    125000.0,
    63004.03226,
    31281.28128,
    15625.0,
    7812.5,
    3906.25,
    1953.125,
    976.5625,
    488.28125,
    244.140625,
];

#[allow(unused)]
mod register {
    pub const ID: u8 = 0xD0;
    pub const RESET: u8 = 0xE0;
    pub const CONFIG: u8 = 0x75;
    pub const CTRL_MEAS: u8 = 0x74; // |osrs_t<2:0>|osrs_p<2:0>|mode<1:0>|
    pub const CTRL_HUM: u8 = 0x72;
    pub const CTRL_GAS_1: u8 = 0x71;
    pub const CTRL_GAS_0: u8 = 0x70;
    pub const GAS_WAIT_0: u8 = 0x64; // 0x64...0x6D
    pub const RES_HEAT_0: u8 = 0x5A; // 0x5A...0x63
    pub const FIELD_0: u8 = 0x1D; // status, index, press, temp, hum, gas
    pub const COEFF_1: u8 = 0x89;
    pub const COEFF_2: u8 = 0xE1;
    pub const RES_HEAT_VAL: u8 = 0x00;
    pub const RES_HEAT_RANGE: u8 = 0x02;
    pub const RANGE_SW_ERR: u8 = 0x04;
}

#[bitfield(u8)]
struct CtrlMeas {
    #[bits(5..=7, rw)]
    osrs_t: u3,

    #[bits(2..=4, rw)]
    osrs_p: u3,

    #[bits(0..=1, rw)]
    mode: u2,
}

#[bitfield(u8)]
struct CtrlHum {
    #[bits(0..=2, rw)]
    osrs_h: u3,
}

#[bitfield(u8)]
struct ConfigReg {
    #[bits(2..=4, rw)]
    filter: u3,
}

#[bitfield(u8)]
struct CtrlGas1 {
    #[bits(0..=3, rw)]
    nb_conv: u4,

    #[bit(4, rw)]
    run_gas: bool,
}

#[bitfield(u8)]
struct CtrlGas0 {
    #[bit(3, rw)]
    heat_off: bool,
}

#[bitfield(u8)]
struct MeasStatus0 {
    #[bit(7, r)]
    new_data: bool,

    #[bit(6, r)]
    gas_measuring: bool,

    #[bit(5, r)]
    measuring: bool,

    #[bits(0..=3, r)]
    gas_meas_index: u4,
}

#[bitfield(u8)]
struct GasRLsb {
    #[bits(6..=7, r)]
    gas_r: u2,

    #[bit(5, r)]
    gas_valid: bool,

    #[bit(4, r)]
    heat_stab: bool,

    #[bits(0..=3, r)]
    gas_range: u4,
}

#[bitfield(u8)]
struct GasWait {
    #[bits(0..=5, rw)]
    timer: u6,

    #[bits(6..=7, rw)]
    multiplier: u2,
}

#[repr(u8)]
#[allow(unused)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum Oversampling {
    Skip = 0,
    X1 = 0b001,
    X2 = 0b010,
    X4 = 0b011,
    X8 = 0b100,
    X16 = 0b101,
}

#[repr(u8)]
#[allow(unused)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum IirFilterSize {
    Fc0 = 0b000,
    Fc1 = 0b001,
    Fc3 = 0b010,
    Fc7 = 0b011,
    Fc15 = 0b100,
    Fc31 = 0b101,
    Fc63 = 0b110,
    Fc127 = 0b111,
}

#[repr(u8)]
#[derive(Debug, Clone, Copy)]
enum Mode {
    Sleep = 0b00,
    Forced = 0b01,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct GasHeater {
    pub(crate) temperature_c: u16,
    pub(crate) duration_ms: u16,
    pub(crate) profile: u8, // 0-9
}

impl Default for GasHeater {
    fn default() -> Self {
        Self {
            temperature_c: 320,
            duration_ms: 150,
            profile: 0,
        }
    }
}

/// Measurement setup written once after the device is found.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct SensorSettings {
    pub(crate) humidity_oversampling: Oversampling,
    pub(crate) pressure_oversampling: Oversampling,
    pub(crate) temperature_oversampling: Oversampling,
    pub(crate) filter: IirFilterSize,
    /// Added to the compensated temperature, in °C.
    pub(crate) temperature_offset: f32,
    pub(crate) gas_heater: Option<GasHeater>,
}

impl Default for SensorSettings {
    fn default() -> Self {
        Self {
            humidity_oversampling: Oversampling::X2,
            pressure_oversampling: Oversampling::X4,
            temperature_oversampling: Oversampling::X8,
            filter: IirFilterSize::Fc3,
            temperature_offset: 0.0,
            gas_heater: None,
        }
    }
}

/// Factory trimming coefficients.
#[derive(Default, Debug, Clone, PartialEq)]
pub(crate) struct Calibration {
    // temperature sensor
    par_t1: u16,
    par_t2: i16,
    par_t3: i8,

    // pressure sensor
    par_p1: u16,
    par_p2: i16,
    par_p3: i8,
    par_p4: i16,
    par_p5: i16,
    par_p6: i8,
    par_p7: i8,
    par_p8: i16,
    par_p9: i16,
    par_p10: u8,

    // humidity
    par_h1: u16,
    par_h2: u16,
    par_h3: i8,
    par_h4: i8,
    par_h5: i8,
    par_h6: u8,
    par_h7: i8,

    // gas sensor
    par_g1: i8,
    par_g2: i16,
    par_g3: i8,
    res_heat_range: u8,
    res_heat_val: i8,
    range_sw_err: i8,
}

impl Calibration {
    /// `coeff` is the 0x89 block followed by the 0xE1 block.
    fn from_registers(
        coeff: &[u8; COEFF_1_LENGTH + COEFF_2_LENGTH],
        res_heat_val: u8,
        res_heat_range: u8,
        range_sw_err: u8,
    ) -> Self {
        let le = |lsb: usize| u16::from_le_bytes([coeff[lsb], coeff[lsb + 1]]);

        Self {
            par_t1: le(33),
            par_t2: le(1) as i16,
            par_t3: coeff[3] as i8,

            par_p1: le(5),
            par_p2: le(7) as i16,
            par_p3: coeff[9] as i8,
            par_p4: le(11) as i16,
            par_p5: le(13) as i16,
            par_p6: coeff[16] as i8,
            par_p7: coeff[15] as i8,
            par_p8: le(19) as i16,
            par_p9: le(21) as i16,
            par_p10: coeff[23],

            // 12 bit values sharing the nibbles of 0xE2
            par_h1: (u16::from(coeff[27]) << 4) | u16::from(coeff[26] & 0x0F),
            par_h2: (u16::from(coeff[25]) << 4) | u16::from(coeff[26] >> 4),
            par_h3: coeff[28] as i8,
            par_h4: coeff[29] as i8,
            par_h5: coeff[30] as i8,
            par_h6: coeff[31],
            par_h7: coeff[32] as i8,

            par_g1: coeff[37] as i8,
            par_g2: le(35) as i16,
            par_g3: coeff[38] as i8,
            res_heat_range: (res_heat_range & 0x30) >> 4,
            res_heat_val: res_heat_val as i8,
            range_sw_err: (range_sw_err as i8) >> 4,
        }
    }

    /// Returns °C and `t_fine`, the latter feeds the other compensations.
    fn temperature(&self, temp_adc: u32, t_fine_offset: f32) -> (f32, f32) {
        let temp_adc = temp_adc as f32;
        let par_t1 = self.par_t1 as f32;
        let par_t2 = self.par_t2 as f32;
        let par_t3 = self.par_t3 as f32;

        let var1 = ((temp_adc / 16384.0) - (par_t1 / 1024.0)) * par_t2;
        let var2 = ((temp_adc / 131072.0) - (par_t1 / 8192.0))
            * ((temp_adc / 131072.0) - (par_t1 / 8192.0))
            * (par_t3 * 16.0);
        let t_fine = var1 + var2 + t_fine_offset;

        (t_fine / 5120.0, t_fine)
    }

    /// In Pa.
    fn pressure(&self, press_adc: u32, t_fine: f32) -> f32 {
        let press_adc = press_adc as f32;
        let par_p1 = self.par_p1 as f32;
        let par_p2 = self.par_p2 as f32;
        let par_p3 = self.par_p3 as f32;
        let par_p4 = self.par_p4 as f32;
        let par_p5 = self.par_p5 as f32;
        let par_p6 = self.par_p6 as f32;
        let par_p7 = self.par_p7 as f32;
        let par_p8 = self.par_p8 as f32;
        let par_p9 = self.par_p9 as f32;
        let par_p10 = self.par_p10 as f32;

        let var1 = (t_fine / 2.0) - 64000.0;
        let var2 = var1 * var1 * (par_p6 / 131072.0);
        let var2 = var2 + (var1 * par_p5 * 2.0);
        let var2 = (var2 / 4.0) + (par_p4 * 65536.0);
        let var1 = (((par_p3 * var1 * var1) / 16384.0) + (par_p2 * var1)) / 524288.0;
        let var1 = (1.0 + (var1 / 32768.0)) * par_p1;
        if var1 == 0.0 {
            return 0.0;
        }

        let press_comp = 1048576.0 - press_adc;
        let press_comp = ((press_comp - (var2 / 4096.0)) * 6250.0) / var1;
        let var1 = (par_p9 * press_comp * press_comp) / 2147483648.0;
        let var2 = press_comp * (par_p8 / 32768.0);
        let var3 = (press_comp / 256.0)
            * (press_comp / 256.0)
            * (press_comp / 256.0)
            * (par_p10 / 131072.0);

        press_comp + (var1 + var2 + var3 + (par_p7 * 128.0)) / 16.0
    }

    /// In %RH.
    fn humidity(&self, hum_adc: u32, temp_comp: f32) -> f32 {
        let hum_adc = hum_adc as f32;
        let par_h1 = self.par_h1 as f32;
        let par_h2 = self.par_h2 as f32;
        let par_h3 = self.par_h3 as f32;
        let par_h4 = self.par_h4 as f32;
        let par_h5 = self.par_h5 as f32;
        let par_h6 = self.par_h6 as f32;
        let par_h7 = self.par_h7 as f32;

        let var1 = hum_adc - ((par_h1 * 16.0) + ((par_h3 / 2.0) * temp_comp));
        let var2 = var1
            * ((par_h2 / 262144.0)
                * (1.0
                    + ((par_h4 / 16384.0) * temp_comp)
                    + ((par_h5 / 1048576.0) * temp_comp * temp_comp)));
        let var3 = par_h6 / 16384.0;
        let var4 = par_h7 / 2097152.0;

        (var2 + ((var3 + (var4 * temp_comp)) * var2 * var2)).clamp(0.0, 100.0)
    }

    /// In ohm.
    fn gas_resistance(&self, gas_adc: u16, gas_range: u8) -> f32 {
        let range = usize::from(gas_range & 0x0F);
        let var1 = (1340.0 + 5.0 * self.range_sw_err as f32) * GAS_RANGE_K1[range];

        var1 * GAS_RANGE_K2[range] / (gas_adc as f32 - 512.0 + var1)
    }

    fn heater_resistance(&self, target_temp: f32, amb_temp: f32) -> u8 {
        let target_temp = target_temp.min(MAX_HEATER_TEMPERATURE);
        let par_g1 = self.par_g1 as f32;
        let par_g2 = self.par_g2 as f32;
        let par_g3 = self.par_g3 as f32;
        let res_heat_val = self.res_heat_val as f32;
        let res_heat_range = self.res_heat_range as f32;

        let var1 = par_g1 / 16.0 + 49.0;
        let var2 = (par_g2 / 32768.0 * 0.0005) + 0.00235;
        let var3 = par_g3 / 1024.0;
        let var4 = var1 * (1.0 + (var2 * target_temp));
        let var5 = var4 + (var3 * amb_temp);

        (3.4 * ((var5 * (4.0 / (4.0 + res_heat_range)) * (1.0 / (1.0 + (res_heat_val * 0.002))))
            - 25.0)) as u8
    }
}

/// Heater on-time register value: 6 bit steps of 1 ms and a x1/x4/x16/x64 multiplier.
pub(crate) fn calc_gas_wait_time(duration_ms: u16) -> u8 {
    if duration_ms >= 0xFC0 {
        return 0xFF;
    }

    let mut duration = duration_ms;
    let mut factor = 0_u8;
    while duration > 0x3F {
        duration /= 4;
        factor += 1;
    }

    GasWait::new_with_raw_value(0)
        .with_timer(u6::new(duration as u8))
        .with_multiplier(u2::new(factor))
        .raw_value()
}

/// Raw ADC values of the first measurement field.
#[derive(Debug, Clone, Copy)]
struct FieldData {
    press_adc: u32,
    temp_adc: u32,
    hum_adc: u32,
    gas_adc: u16,
    gas_r_lsb: u8,
}

impl FieldData {
    fn parse(buf: &[u8; FIELD_LENGTH]) -> Self {
        let adc20 = |msb: usize| {
            (u32::from(buf[msb]) << 12) | (u32::from(buf[msb + 1]) << 4) | (u32::from(buf[msb + 2]) >> 4)
        };
        let gas = GasRLsb::new_with_raw_value(buf[14]);

        Self {
            press_adc: adc20(2),
            temp_adc: adc20(5),
            hum_adc: (u32::from(buf[8]) << 8) | u32::from(buf[9]),
            gas_adc: (u16::from(buf[13]) << 2) | u16::from(gas.gas_r().value()),
            gas_r_lsb: buf[14],
        }
    }
}

pub(crate) struct Bme680<I2C, D> {
    i2c: I2C,
    delay: D,
    address: u8,
    cal: Calibration,
    t_fine_offset: f32,
    gas_enabled: bool,
}

impl<I2C: I2c, D: DelayNs> Bme680<I2C, D> {
    /// Finds the device on the primary address, then on the secondary one,
    /// resets it and reads the factory calibration.
    pub(crate) fn new(mut i2c: I2C, mut delay: D) -> anyhow::Result<Self> {
        let address = probe(&mut i2c, I2C_ADDR_PRIMARY)
            .or_else(|primary| {
                probe(&mut i2c, I2C_ADDR_SECONDARY).map_err(|secondary| {
                    anyhow!("‼️ BME680 not found: {primary:#}; {secondary:#}")
                })
            })?;
        info!("BME680 found at {:#04x}", address);

        write_reg(&mut i2c, address, register::RESET, SOFT_RESET_CMD)?;
        delay.delay_ms(10);

        let mut device = Self {
            i2c,
            delay,
            address,
            cal: Calibration::default(),
            t_fine_offset: 0.0,
            gas_enabled: false,
        };
        device.cal = device
            .read_calibration()
            .context("‼️ Failed to read BME680 calibration")?;
        debug!("Calibration data:\n{:?}", &device.cal);

        Ok(device)
    }

    pub(crate) fn address(&self) -> u8 {
        self.address
    }

    fn read_calibration(&mut self) -> anyhow::Result<Calibration> {
        let mut coeff = [0_u8; COEFF_1_LENGTH + COEFF_2_LENGTH];
        let (first, second) = coeff.split_at_mut(COEFF_1_LENGTH);
        self.read_regs(register::COEFF_1, first)?;
        self.read_regs(register::COEFF_2, second)?;

        let res_heat_val = self.read_reg(register::RES_HEAT_VAL)?;
        let res_heat_range = self.read_reg(register::RES_HEAT_RANGE)?;
        let range_sw_err = self.read_reg(register::RANGE_SW_ERR)?;

        Ok(Calibration::from_registers(
            &coeff,
            res_heat_val,
            res_heat_range,
            range_sw_err,
        ))
    }

    pub(crate) fn setup(&mut self, settings: &SensorSettings) -> anyhow::Result<()> {
        self.t_fine_offset = settings.temperature_offset * 5120.0;

        let ctrl_hum = CtrlHum::new_with_raw_value(self.read_reg(register::CTRL_HUM)?)
            .with_osrs_h(u3::new(settings.humidity_oversampling as u8));
        self.write_reg(register::CTRL_HUM, ctrl_hum.raw_value())?;

        let config = ConfigReg::new_with_raw_value(self.read_reg(register::CONFIG)?)
            .with_filter(u3::new(settings.filter as u8));
        self.write_reg(register::CONFIG, config.raw_value())?;

        // humidity settings only take effect after a write to ctrl_meas
        let ctrl_meas = CtrlMeas::new_with_raw_value(self.read_reg(register::CTRL_MEAS)?)
            .with_osrs_t(u3::new(settings.temperature_oversampling as u8))
            .with_osrs_p(u3::new(settings.pressure_oversampling as u8))
            .with_mode(u2::new(Mode::Sleep as u8));
        self.write_reg(register::CTRL_MEAS, ctrl_meas.raw_value())?;

        let ctrl_gas_1 = CtrlGas1::new_with_raw_value(self.read_reg(register::CTRL_GAS_1)?);
        let ctrl_gas_1 = match settings.gas_heater {
            Some(heater) => {
                if heater.profile > 9 {
                    bail!("‼️ Gas heater profile {} out of range 0-9", heater.profile);
                }

                self.write_reg(
                    register::GAS_WAIT_0 + heater.profile,
                    calc_gas_wait_time(heater.duration_ms),
                )?;
                let res_heat = self
                    .cal
                    .heater_resistance(heater.temperature_c as f32, AMBIENT_TEMPERATURE);
                self.write_reg(register::RES_HEAT_0 + heater.profile, res_heat)?;

                let ctrl_gas_0 = CtrlGas0::new_with_raw_value(self.read_reg(register::CTRL_GAS_0)?)
                    .with_heat_off(false);
                self.write_reg(register::CTRL_GAS_0, ctrl_gas_0.raw_value())?;

                ctrl_gas_1
                    .with_nb_conv(u4::new(heater.profile))
                    .with_run_gas(true)
            }
            None => ctrl_gas_1.with_run_gas(false),
        };
        self.write_reg(register::CTRL_GAS_1, ctrl_gas_1.raw_value())?;
        self.gas_enabled = settings.gas_heater.is_some();

        Ok(())
    }

    /// Runs one forced-mode measurement; `None` when the device never flags new data.
    pub(crate) fn read_measurements(&mut self) -> anyhow::Result<Option<Reading>> {
        let ctrl_meas = CtrlMeas::new_with_raw_value(self.read_reg(register::CTRL_MEAS)?)
            .with_mode(u2::new(Mode::Forced as u8));
        self.write_reg(register::CTRL_MEAS, ctrl_meas.raw_value())?;

        let mut buf = [0_u8; FIELD_LENGTH];
        for _ in 0..POLL_ATTEMPTS {
            self.read_regs(register::FIELD_0, &mut buf)?;

            if MeasStatus0::new_with_raw_value(buf[0]).new_data() {
                return Ok(Some(self.compensate(&FieldData::parse(&buf))));
            }

            self.delay.delay_ms(POLL_PERIOD_MS);
        }

        Ok(None)
    }

    fn compensate(&self, field: &FieldData) -> Reading {
        let (temperature, t_fine) = self.cal.temperature(field.temp_adc, self.t_fine_offset);
        let pressure = self.cal.pressure(field.press_adc, t_fine);
        let humidity = self.cal.humidity(field.hum_adc, temperature);

        let gas = GasRLsb::new_with_raw_value(field.gas_r_lsb);
        let gas_resistance = (self.gas_enabled && gas.gas_valid() && gas.heat_stab())
            .then(|| self.cal.gas_resistance(field.gas_adc, gas.gas_range().value()));

        Reading {
            temperature,
            pressure: pressure / 100.0, // Pa to hPa
            humidity,
            gas_resistance,
        }
    }

    fn read_reg(&mut self, reg: u8) -> anyhow::Result<u8> {
        let mut buffer = [0_u8; 1];
        self.read_regs(reg, &mut buffer)?;
        Ok(buffer[0])
    }

    // bme680 autoincrements the register
    fn read_regs(&mut self, reg: u8, buffer: &mut [u8]) -> anyhow::Result<()> {
        read_regs(&mut self.i2c, self.address, reg, buffer)
    }

    fn write_reg(&mut self, reg: u8, data: u8) -> anyhow::Result<()> {
        write_reg(&mut self.i2c, self.address, reg, data)
    }
}

fn probe<I2C: I2c>(i2c: &mut I2C, address: u8) -> anyhow::Result<u8> {
    let mut id = [0_u8; 1];
    read_regs(i2c, address, register::ID, &mut id)?;

    if id[0] != CHIP_ID {
        bail!("unexpected chip id {:#04x} at {:#04x}", id[0], address);
    }

    Ok(address)
}

fn read_regs<I2C: I2c>(i2c: &mut I2C, address: u8, reg: u8, buffer: &mut [u8]) -> anyhow::Result<()> {
    i2c.write_read(address, &[reg], buffer)
        .map_err(|e| anyhow!("I2C read of {:#04x} at {:#04x} failed: {:?}", reg, address, e))
}

fn write_reg<I2C: I2c>(i2c: &mut I2C, address: u8, reg: u8, data: u8) -> anyhow::Result<()> {
    i2c.write(address, &[reg, data])
        .map_err(|e| anyhow!("I2C write of {:#04x} at {:#04x} failed: {:?}", reg, address, e))
}
