#![no_std]
#![no_main]

use panic_probe as _;
use defmt_rtt as _;

#[rtic::app(device = stm32f4xx_hal::pac, peripherals = true)]
mod app {
    use stm32f4xx_hal::{
        prelude::*,
        gpio::{ErasedPin, Output, Input},
        pac,
        timer::Event,
        serial::{Serial, Config as SerialConfig, WordLength, Parity},
        rcc::Config,
    };

    use core::sync::atomic::{AtomicU64, Ordering};
    use heapless::{String, Vec};
    use core::fmt::Write as _;

    use wbus_core::config::{NODE_RECEIVER, NODE_SENDER, RECEIVER_IDLE_LISTEN_WINDOW_MS};
    use wbus_core::menu::{ButtonEdge, Menu};
    use wbus_core::packet::{CommandKind, MAX_WIRE_LEN};
    use wbus_core::radio::{RadioLink, RxFrame};
    use wbus_core::receiver::{CommandSource, PersistentStore, ReceiverLoop, TlvSupport};
    use wbus_core::wbus::transport::{Clock, WBusPort};

    #[cfg(feature = "mqtt")]
    use wbus_core::mqtt;

    const NETWORK_ID: u8 = 18;
    const LORA_FREQ: u32 = 915;
    const CONTROLLER_ADDR: u8 = 0xF;
    const HEATER_ADDR: u8 = 0x4;
    const MENU_ITEM_COUNT: u8 = 3;

    /// Same placeholder key `sender-firmware` uses; real provisioning
    /// (credential loading) is out of scope.
    const RADIO_KEY: [u8; 16] = [
        0x00, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77,
        0x88, 0x99, 0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF,
    ];

    /// Free-running millisecond tick, advanced by `TIM3`'s 1kHz interrupt
    /// and read without locking from the `idle` task — the alternative of
    /// sharing it as an RTIC resource would mean holding its lock (and
    /// starving the tick ISR) across the multi-second sleeps the Receiver
    /// loop itself issues.
    static TICK_MS: AtomicU64 = AtomicU64::new(0);

    struct SystemClock;

    impl Clock for SystemClock {
        fn now_ms(&self) -> u64 {
            TICK_MS.load(Ordering::Relaxed)
        }

        fn delay_ms(&mut self, ms: u32) {
            // `disable-sleep` keeps the receiver fully awake through Idle
            // (spec.md §9 REDESIGN note) by making this a no-op: the
            // caller's sleep branch falls straight through and the loop
            // re-enters its listen window immediately.
            #[cfg(feature = "disable-sleep")]
            {
                let _ = ms;
            }
            #[cfg(not(feature = "disable-sleep"))]
            {
                let target = self.now_ms() + ms as u64;
                while self.now_ms() < target {
                    cortex_m::asm::wfi();
                }
            }
        }
    }

    /// Backed by a RAM region the board's linker script excludes from
    /// zero-init on wake from sleep (not reproduced here); cold boot still
    /// zeroes it, matching spec.md §5 "neither persisted across cold boot".
    #[derive(Clone, Copy)]
    struct RetainedState {
        last_processed_seq: u16,
        tlv_support: u8,
    }

    #[link_section = ".uninit.wbus_retained"]
    static mut RETAINED: RetainedState = RetainedState { last_processed_seq: 0, tlv_support: 0 };

    fn tlv_from_u8(v: u8) -> TlvSupport {
        match v {
            1 => TlvSupport::No,
            2 => TlvSupport::Yes,
            _ => TlvSupport::Unknown,
        }
    }

    struct RetainedStore;

    impl PersistentStore for RetainedStore {
        fn load(&self) -> (u16, TlvSupport) {
            unsafe { (RETAINED.last_processed_seq, tlv_from_u8(RETAINED.tlv_support)) }
        }
        fn save(&mut self, last_processed_seq: u16, tlv_support: TlvSupport) {
            unsafe {
                RETAINED.last_processed_seq = last_processed_seq;
                RETAINED.tlv_support = tlv_support as u8;
            }
        }
    }

    /// RYLR998 link, purely polled from the `idle` task — no UART
    /// interrupt, so there is nothing to race with the listen-window busy
    /// loop `ReceiverLoop::run_once` runs inline.
    struct Rylr998Link {
        uart: Serial<pac::UART4>,
        rx_buf: Vec<u8, 128>,
    }

    impl Rylr998Link {
        fn drain_uart(&mut self) {
            while let Ok(byte) = self.uart.read() {
                if self.rx_buf.push(byte).is_err() {
                    self.rx_buf.clear();
                }
            }
        }
    }

    impl RadioLink for Rylr998Link {
        type Error = ();

        fn send(&mut self, frame: &[u8]) -> Result<(), ()> {
            let mut cmd: String<16> = String::new();
            let _ = write!(cmd, "AT+SEND={},{},", NODE_SENDER as u32, frame.len());
            for b in cmd.as_bytes() {
                let _ = nb::block!(self.uart.write(*b));
            }
            for b in frame {
                let _ = nb::block!(self.uart.write(*b));
            }
            let _ = nb::block!(self.uart.write(b'\r'));
            let _ = nb::block!(self.uart.write(b'\n'));
            Ok(())
        }

        fn try_recv(&mut self) -> Result<Option<RxFrame>, ()> {
            self.drain_uart();
            let len = self.rx_buf.len();
            if len >= 2 && self.rx_buf[len - 2] == b'\r' && self.rx_buf[len - 1] == b'\n' {
                let frame = parse_rcv_frame(self.rx_buf.as_slice());
                self.rx_buf.clear();
                return Ok(frame);
            }
            Ok(None)
        }

        // Duty-cycle hooks: a real RYLR998 has no documented low-power
        // receive mode, so these gate MCU-side behavior only, via the
        // `disable-sleep` feature on `SystemClock::delay_ms`.
        fn sleep(&mut self) {}
        fn receive(&mut self) {}
        fn idle(&mut self) {}
    }

    /// Same framing `sender-firmware` parses, with one extra field: the
    /// declared length is required to slice out the binary payload
    /// exactly, since it may itself contain comma/CR/LF bytes.
    fn parse_rcv_frame(buffer: &[u8]) -> Option<RxFrame> {
        if buffer.len() < 10 || &buffer[0..5] != b"+RCV=" {
            return None;
        }
        let mut comma1 = None;
        let mut comma2 = None;
        for (i, &byte) in buffer[5..].iter().enumerate() {
            if byte == b',' {
                if comma1.is_none() {
                    comma1 = Some(5 + i);
                } else {
                    comma2 = Some(5 + i);
                    break;
                }
            }
        }
        let comma1 = comma1?;
        let comma2 = comma2?;
        let len_str = core::str::from_utf8(&buffer[comma1 + 1..comma2]).ok()?;
        let payload_len: usize = len_str.parse().ok()?;

        let payload_start = comma2 + 1;
        let payload_end = payload_start + payload_len;
        if payload_end > buffer.len() || payload_len > MAX_WIRE_LEN {
            return None;
        }

        let mut data: Vec<u8, MAX_WIRE_LEN> = Vec::new();
        data.extend_from_slice(&buffer[payload_start..payload_end]).ok()?;

        let rest = core::str::from_utf8(&buffer[payload_end..]).ok()?;
        let rest = rest.trim_matches(|c| c == ',' || c == '\r' || c == '\n');
        let mut parts = rest.splitn(2, ',');
        let rssi_dbm: i16 = parts.next()?.trim_start_matches(',').parse().ok()?;
        let snr_db: i16 = parts.next().unwrap_or("0").parse().unwrap_or(0);

        Some(RxFrame { data, rssi_dbm, snr_db })
    }

    fn send_at_command(uart: &mut Serial<pac::UART4>, cmd: &str) {
        defmt::info!("radio AT: {}", cmd);
        for byte in cmd.as_bytes() {
            let _ = nb::block!(uart.write(*byte));
        }
        let _ = nb::block!(uart.write(b'\r'));
        let _ = nb::block!(uart.write(b'\n'));
        cortex_m::asm::delay(8_400_000);
    }

    /// W-BUS single-wire UART + the break-pulse/half-duplex GPIO control
    /// `ensure_break` drives. `USART1` runs at 2400 8E1 directly (the hal
    /// exposes the even-parity 9th-bit framing as `wordlength_9` +
    /// `parity_even`, so 8 data bits plus parity are sent on the wire as
    /// spec.md's "2400 baud, 8 data bits, even parity, 1 stop" requires).
    struct WBusPortImpl {
        uart: Serial<pac::USART1>,
        enable_pin: ErasedPin<Output>,
        line_pin: ErasedPin<Output>,
    }

    impl WBusPort for WBusPortImpl {
        type Error = ();

        fn write_byte(&mut self, byte: u8) -> nb::Result<(), ()> {
            self.uart.write(byte).map_err(|_| nb::Error::WouldBlock)
        }
        fn read_byte(&mut self) -> nb::Result<u8, ()> {
            self.uart.read().map_err(|_| nb::Error::WouldBlock)
        }
        fn flush(&mut self) -> Result<(), ()> {
            Ok(())
        }
        fn set_enable(&mut self, asserted: bool) {
            if asserted {
                self.enable_pin.set_high();
            } else {
                self.enable_pin.set_low();
            }
        }
        fn disable_uart(&mut self) {}
        fn enable_uart(&mut self) {}
        fn set_line_high(&mut self) {
            self.line_pin.set_high();
        }
        fn set_line_low(&mut self) {
            self.line_pin.set_low();
        }
    }

    /// The three local-button menu items; `Start`'s `minutes == 0` uses
    /// whatever `remembered_minutes` the Receiver last saw (spec.md
    /// §4.7).
    const MENU_ITEMS: [(CommandKind, u8); 3] = [
        (CommandKind::Start, 0),
        (CommandKind::Stop, 0),
        (CommandKind::QueryStatus, 0),
    ];

    #[shared]
    struct Shared {}

    #[local]
    struct Local {
        radio: Rylr998Link,
        engine: ReceiverLoop<WBusPortImpl>,
        store: RetainedStore,
        menu: Menu,
        button: ErasedPin<Input>,
        button_was_low: bool,
    }

    #[init]
    fn init(cx: init::Context) -> (Shared, Local, init::Monotonics) {
        let dp = cx.device;
        let mut rcc = dp.RCC.freeze(Config::hsi().sysclk(84.MHz()));

        let gpioa = dp.GPIOA.split(&mut rcc);
        let gpiob = dp.GPIOB.split(&mut rcc);
        let gpioc = dp.GPIOC.split(&mut rcc);

        // --- UART4: RYLR998 LoRa module ---
        let tx = gpioc.pc10.into_alternate();
        let rx = gpioc.pc11.into_alternate();
        let mut lora_uart = Serial::new(
            dp.UART4,
            (tx, rx),
            SerialConfig::default().baudrate(115200.bps()),
            &mut rcc,
        ).unwrap();

        defmt::info!("Configuring LoRa module (Receiver)...");
        send_at_command(&mut lora_uart, "AT");
        let mut addr_cmd: String<24> = String::new();
        let _ = write!(addr_cmd, "AT+ADDRESS={}", NODE_RECEIVER);
        send_at_command(&mut lora_uart, addr_cmd.as_str());

        let mut cmd_buf: String<32> = String::new();
        let _ = write!(cmd_buf, "AT+NETWORKID={}", NETWORK_ID);
        send_at_command(&mut lora_uart, cmd_buf.as_str());
        cmd_buf.clear();
        let _ = write!(cmd_buf, "AT+BAND={}000000", LORA_FREQ);
        send_at_command(&mut lora_uart, cmd_buf.as_str());
        send_at_command(&mut lora_uart, "AT+PARAMETER=7,9,1,7");
        while lora_uart.read().is_ok() {}

        // --- USART1: W-BUS single-wire link to the heater ---
        let wbus_tx = gpiob.pb6.into_alternate();
        let wbus_rx = gpiob.pb7.into_alternate();
        let wbus_uart = Serial::new(
            dp.USART1,
            (wbus_tx, wbus_rx),
            SerialConfig::default()
                .baudrate(2_400.bps())
                .wordlength(WordLength::DataBits9)
                .parity(Parity::ParityEven),
            &mut rcc,
        ).unwrap();

        let enable_pin = gpiob.pb0.into_push_pull_output().erase();
        let line_pin = gpiob.pb1.into_push_pull_output().erase();
        let port = WBusPortImpl { uart: wbus_uart, enable_pin, line_pin };

        let store = RetainedStore;
        let engine = ReceiverLoop::new(port, CONTROLLER_ADDR, HEATER_ADDR, RADIO_KEY, &store);

        // --- Local button (menu), active-low on Nucleo's PC13 ---
        let button = gpioc.pc13.into_pull_up_input().erase();

        // --- 1kHz tick for the free-running clock ---
        let mut tick_timer = dp.TIM3.counter_hz(&mut rcc);
        tick_timer.start(1_000.Hz()).unwrap();
        tick_timer.listen(Event::Update);
        core::mem::forget(tick_timer); // lives for the program's duration; no further access needed

        let _ = gpioa; // reserved for a future MQTT/status LED pin

        (
            Shared {},
            Local {
                radio: Rylr998Link { uart: lora_uart, rx_buf: Vec::new() },
                engine,
                store,
                menu: Menu::new(MENU_ITEM_COUNT),
                button,
                button_was_low: false,
            },
            init::Monotonics(),
        )
    }

    #[task(binds = TIM3)]
    fn tick_handler(_cx: tick_handler::Context) {
        let regs = unsafe { &*pac::TIM3::ptr() };
        regs.sr().modify(|_, w| w.uif().clear_bit());
        TICK_MS.fetch_add(1, Ordering::Relaxed);
    }

    /// The outer duty cycle (spec.md §4.7): drives `ReceiverLoop::run_once`
    /// back to back, polling the local button into the menu state machine
    /// between iterations. Runs at the lowest RTIC priority, so the tick
    /// ISR above always preempts it.
    #[idle(local = [radio, engine, store, menu, button, button_was_low])]
    fn idle(cx: idle::Context) -> ! {
        let mut clock = SystemClock;

        loop {
            let now = clock.now_ms();

            let is_low = cx.local.button.is_low();
            if is_low != *cx.local.button_was_low {
                *cx.local.button_was_low = is_low;
                let edge = if is_low { ButtonEdge::Pressed } else { ButtonEdge::Released };
                cx.local.menu.on_edge(edge, now);
            }
            cx.local.menu.on_tick(now);

            if let Some(activation) = cx.local.menu.take_activation() {
                if let Some(&(kind, minutes)) = MENU_ITEMS.get(activation.item_index as usize) {
                    let seq = cx.local.engine.state.last_processed_seq.wrapping_add(1).max(1);
                    let status = cx.local.engine.dispatch_command(
                        &mut clock,
                        cx.local.store,
                        seq,
                        wbus_core::packet::CommandPayload { kind, minutes },
                        CommandSource::Menu,
                        now,
                    );
                    defmt::info!("menu activation: state={} min={}", status.heater_state as u8, status.minutes_remaining);
                }
            }

            cx.local.engine.run_once(cx.local.radio, &mut clock, cx.local.store, now);

            // The listen window inside `run_once` already consumes
            // `RECEIVER_IDLE_LISTEN_WINDOW_MS` worth of wall-clock time
            // when nothing arrives; nothing further to wait on here.
            let _ = RECEIVER_IDLE_LISTEN_WINDOW_MS;
        }
    }

    #[cfg(feature = "mqtt")]
    mod mqtt_bridge {
        //! Topic wiring around `wbus_core::mqtt`'s freshness check and
        //! payload builders. The broker/TLS client itself is out of scope
        //! (spec.md §6 Non-goals); a real build wires this module to
        //! whatever embedded MQTT client the target board support crate
        //! offers and calls `on_publish`/`build_status` from its callback.
        use super::mqtt;
        use wbus_core::packet::StatusPayload;

        pub fn on_publish(bytes: &[u8], now_s: u32) -> Option<wbus_core::packet::CommandPayload> {
            let cmd = mqtt::decode_command(bytes).ok()?;
            mqtt::check_freshness(&cmd, now_s).ok()?;
            Some(cmd.payload)
        }

        pub fn build_status(status: &StatusPayload) -> Option<mqtt::StatusJson> {
            mqtt::build_status_json(status).ok()
        }
    }
}
