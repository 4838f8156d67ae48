#![no_std]
#![no_main]

use panic_probe as _;
use defmt_rtt as _;

#[rtic::app(device = stm32f4xx_hal::pac, peripherals = true)]
mod app {
    use stm32f4xx_hal::{
        prelude::*,
        gpio::{Output, Pin},
        pac,
        timer::{CounterHz, Event},
        serial::{Serial, Config as SerialConfig, Event as SerialEvent},
        i2c::I2c,
        rcc::Config,
    };

    use ssd1306::{prelude::*, Ssd1306, mode::BufferedGraphicsMode};
    use display_interface_i2c::I2CInterface;
    use embedded_graphics::{
        mono_font::{ascii::FONT_6X10, MonoTextStyleBuilder},
        pixelcolor::BinaryColor,
        prelude::*,
        text::Text,
    };
    use heapless::{String, Vec, Deque};
    use core::fmt::Write as _;

    use wbus_core::config::{NODE_RECEIVER, NODE_SENDER, SENDER_ACK_DEADLINE_MS, SENDER_RETRY_PERIOD_MS};
    use wbus_core::packet::{CommandKind, MAX_WIRE_LEN};
    use wbus_core::radio::{RadioLink, RxFrame};
    use wbus_core::sender::{SenderEngine, SubmitOutcome};

    // --- Configuration constants ---
    const NODE_ID: &str = "Sender";
    const NETWORK_ID: u8 = 18; // LoRa network ID, shared with receiver-firmware
    const LORA_FREQ: u32 = 915; // MHz; 915 for US, 868 for EU

    /// Placeholder pre-shared key. Real provisioning (credential loading)
    /// is out of scope; both nodes are built from the same constant here.
    const RADIO_KEY: [u8; 16] = [
        0x00, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77,
        0x88, 0x99, 0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF,
    ];

    /// `TIM2` tick period; everything timed in the engine and the CLI is
    /// expressed against the millisecond counter this tick advances.
    const TICK_MS: u64 = 10;

    type LoraDisplay = Ssd1306<I2CInterface<I2c<pac::I2C1>>, DisplaySize128x64, BufferedGraphicsMode<DisplaySize128x64>>;

    /// Adapts the locked LoRa UART + a shared inbound frame queue to
    /// [`RadioLink`] for the duration of one `poll` call. The Sender never
    /// sleeps its radio (it is always listening for the correlated Status),
    /// so `sleep`/`idle` are no-ops here — unlike `receiver-firmware`,
    /// where they gate the duty cycle.
    struct Rylr998Link<'a> {
        uart: &'a mut Serial<pac::UART4>,
        inbox: &'a mut Deque<RxFrame, 4>,
    }

    impl<'a> RadioLink for Rylr998Link<'a> {
        type Error = ();

        fn send(&mut self, frame: &[u8]) -> Result<(), ()> {
            let mut cmd: String<16> = String::new();
            let _ = write!(cmd, "AT+SEND={},{},", NODE_RECEIVER as u32, frame.len());
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
            Ok(self.inbox.pop_front())
        }

        fn sleep(&mut self) {}
        fn receive(&mut self) {}
        fn idle(&mut self) {}
    }

    /// Parse one `+RCV=<addr>,<len>,<binary>,<rssi>,<snr>\r\n` line off the
    /// module. `<binary>` is exactly `<len>` raw bytes (may itself contain
    /// comma/CR/LF bytes), so the split after it must be computed from the
    /// declared length rather than scanned for.
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
        cortex_m::asm::delay(8_400_000); // ~100ms at 84 MHz
    }

    /// One CLI line, already trimmed. Accepts `start`, `stop`, `run
    /// <minutes 1..255>`; anything else is `None` (spec.md §6 CLI).
    fn parse_cli_line(line: &str) -> Option<(CommandKind, u8)> {
        let line = line.trim();
        if line == "start" {
            return Some((CommandKind::Start, 0));
        }
        if line == "stop" {
            return Some((CommandKind::Stop, 0));
        }
        if let Some(rest) = line.strip_prefix("run ") {
            let minutes: u8 = rest.trim().parse().ok()?;
            if minutes == 0 {
                return None;
            }
            return Some((CommandKind::RunMinutes, minutes));
        }
        None
    }

    fn render_status(display: &mut LoraDisplay, engine: &SenderEngine, pending_note: &str) {
        let _ = display.clear(BinaryColor::Off);
        let style = MonoTextStyleBuilder::new()
            .font(&FONT_6X10)
            .text_color(BinaryColor::On)
            .build();

        let mut line: String<32> = String::new();
        let _ = write!(line, "{} {}", NODE_ID, pending_note);
        Text::new(&line, Point::new(0, 10), style).draw(display).ok();

        if let Some(status) = engine.last_status {
            line.clear();
            let _ = write!(
                line,
                "hs:{} min:{}",
                status.heater_state as u8, status.minutes_remaining
            );
            Text::new(&line, Point::new(0, 24), style).draw(display).ok();

            line.clear();
            let _ = write!(line, "seq:{} err:{}", status.last_cmd_seq, status.last_error);
            Text::new(&line, Point::new(0, 38), style).draw(display).ok();
        }

        let _ = display.flush();
    }

    #[shared]
    struct Shared {
        lora_uart: Serial<pac::UART4>,
        cli_uart: Serial<pac::USART2>,
        display: LoraDisplay,
        engine: SenderEngine,
        rx_queue: Deque<RxFrame, 4>,
        now_ms: u64,
    }

    #[local]
    struct Local {
        led: Pin<'A', 5, Output>,
        timer: CounterHz<pac::TIM2>,
        radio_rx_buf: Vec<u8, 128>,
        cli_rx_buf: String<64>,
    }

    #[init]
    fn init(cx: init::Context) -> (Shared, Local, init::Monotonics) {
        let dp = cx.device;
        let mut rcc = dp.RCC.freeze(Config::hsi().sysclk(84.MHz()));

        let gpioa = dp.GPIOA.split(&mut rcc);
        let gpiob = dp.GPIOB.split(&mut rcc);
        let gpioc = dp.GPIOC.split(&mut rcc);

        let led = gpioa.pa5.into_push_pull_output();

        // --- UART4: RYLR998 LoRa module ---
        let tx = gpioc.pc10.into_alternate();
        let rx = gpioc.pc11.into_alternate();
        let mut lora_uart = Serial::new(
            dp.UART4,
            (tx, rx),
            SerialConfig::default().baudrate(115200.bps()),
            &mut rcc,
        ).unwrap();

        defmt::info!("Configuring LoRa module (Sender)...");
        send_at_command(&mut lora_uart, "AT");
        let mut addr_cmd: String<24> = String::new();
        let _ = write!(addr_cmd, "AT+ADDRESS={}", NODE_SENDER);
        send_at_command(&mut lora_uart, addr_cmd.as_str());

        let mut cmd_buf: String<32> = String::new();
        let _ = write!(cmd_buf, "AT+NETWORKID={}", NETWORK_ID);
        send_at_command(&mut lora_uart, cmd_buf.as_str());

        cmd_buf.clear();
        let _ = write!(cmd_buf, "AT+BAND={}000000", LORA_FREQ);
        send_at_command(&mut lora_uart, cmd_buf.as_str());

        send_at_command(&mut lora_uart, "AT+PARAMETER=7,9,1,7");
        while lora_uart.read().is_ok() {}
        lora_uart.listen(SerialEvent::RxNotEmpty);

        // --- USART2: local diagnostic CLI, 115200 8N1 (spec.md §6) ---
        let cli_tx = gpioa.pa2.into_alternate();
        let cli_rx = gpioa.pa3.into_alternate();
        let mut cli_uart = Serial::new(
            dp.USART2,
            (cli_tx, cli_rx),
            SerialConfig::default().baudrate(115200.bps()),
            &mut rcc,
        ).unwrap();
        cli_uart.listen(SerialEvent::RxNotEmpty);

        // --- I2C1 / OLED ---
        let scl = gpiob.pb8.into_alternate_open_drain();
        let sda = gpiob.pb9.into_alternate_open_drain();
        let i2c = I2c::new(dp.I2C1, (scl, sda), 100.kHz(), &mut rcc);
        let interface = I2CInterface::new(i2c, 0x3C, 0x40);
        let mut display = Ssd1306::new(interface, DisplaySize128x64, DisplayRotation::Rotate0)
            .into_buffered_graphics_mode();
        display.init().unwrap();

        let mut timer = dp.TIM2.counter_hz(&mut rcc);
        timer.start((1_000 / TICK_MS as u32).Hz()).unwrap();
        timer.listen(Event::Update);

        (
            Shared {
                lora_uart,
                cli_uart,
                display,
                engine: SenderEngine::new(RADIO_KEY),
                rx_queue: Deque::new(),
                now_ms: 0,
            },
            Local {
                led,
                timer,
                radio_rx_buf: Vec::new(),
                cli_rx_buf: String::new(),
            },
            init::Monotonics(),
        )
    }

    /// Ticks the millisecond clock, drives the engine's retry/deadline
    /// state machine, and refreshes the display.
    #[task(binds = TIM2, shared = [lora_uart, rx_queue, engine, display, now_ms], local = [led, timer])]
    fn tim2_handler(cx: tim2_handler::Context) {
        cx.local.timer.clear_flags(stm32f4xx_hal::timer::Flag::Update);
        cx.local.led.toggle();

        let (mut lora_uart, mut rx_queue, mut engine, mut display, mut now_ms) = (
            cx.shared.lora_uart,
            cx.shared.rx_queue,
            cx.shared.engine,
            cx.shared.display,
            cx.shared.now_ms,
        );

        let now = now_ms.lock(|n| {
            *n += TICK_MS;
            *n
        });

        let outcome = lora_uart.lock(|uart| {
            rx_queue.lock(|queue| {
                engine.lock(|eng| {
                    let mut link = Rylr998Link { uart, inbox: queue };
                    eng.poll(&mut link, now, SENDER_RETRY_PERIOD_MS)
                })
            })
        });

        if let Some(outcome) = outcome {
            match outcome {
                SubmitOutcome::Ok(status) => {
                    defmt::info!("command completed: seq {}", status.last_cmd_seq);
                }
                SubmitOutcome::TimedOut => {
                    defmt::warn!("command timed out, no correlated status");
                }
            }
        }

        // Refresh the display roughly once a second; every tick would
        // flood the I2C bus for no visible benefit.
        if now % 1_000 < TICK_MS {
            engine.lock(|eng| {
                display.lock(|disp| {
                    let note = if eng.has_pending() { "pending" } else { "idle" };
                    render_status(disp, eng, note);
                });
            });
        }
    }

    /// Collects raw bytes from the RYLR998 and, once a full `+RCV=...\r\n`
    /// line has arrived, parses and queues the frame for the engine.
    #[task(binds = UART4, shared = [lora_uart, rx_queue], local = [radio_rx_buf])]
    fn uart4_handler(cx: uart4_handler::Context) {
        let (mut lora_uart, mut rx_queue) = (cx.shared.lora_uart, cx.shared.rx_queue);
        let mut parsed: Option<RxFrame> = None;

        lora_uart.lock(|uart| {
            while let Ok(byte) = uart.read() {
                if cx.local.radio_rx_buf.push(byte).is_err() {
                    defmt::warn!("radio rx buffer full, clearing");
                    cx.local.radio_rx_buf.clear();
                }
                let len = cx.local.radio_rx_buf.len();
                if byte == b'\n' && len >= 2 && cx.local.radio_rx_buf[len - 2] == b'\r' {
                    parsed = parse_rcv_frame(cx.local.radio_rx_buf.as_slice());
                    cx.local.radio_rx_buf.clear();
                }
            }

            let uart_ptr = unsafe { &*pac::UART4::ptr() };
            let sr = uart_ptr.sr().read();
            if sr.ore().bit_is_set() || sr.nf().bit_is_set() || sr.fe().bit_is_set() {
                let _ = uart_ptr.dr().read();
            }
        });

        if let Some(frame) = parsed {
            rx_queue.lock(|queue| {
                if queue.push_back(frame).is_err() {
                    defmt::warn!("radio rx queue full, dropping frame");
                }
            });
        }
    }

    /// Collects bytes from the local diagnostic line and, on a complete
    /// line, parses and submits a command to the engine.
    #[task(binds = USART2, shared = [cli_uart, engine, now_ms], local = [cli_rx_buf])]
    fn usart2_handler(cx: usart2_handler::Context) {
        let (mut cli_uart, mut engine, mut now_ms) = (cx.shared.cli_uart, cx.shared.engine, cx.shared.now_ms);
        let mut complete_line = false;

        cli_uart.lock(|uart| {
            while let Ok(byte) = uart.read() {
                if byte == b'\n' {
                    complete_line = true;
                    break;
                }
                if byte != b'\r' && cx.local.cli_rx_buf.push(byte as char).is_err() {
                    cx.local.cli_rx_buf.clear();
                }
            }
        });

        if !complete_line {
            return;
        }

        let line = cx.local.cli_rx_buf.clone();
        cx.local.cli_rx_buf.clear();

        match parse_cli_line(line.as_str()) {
            Some((kind, minutes)) => {
                let now = now_ms.lock(|n| *n);
                let result = engine.lock(|eng| eng.submit(kind, minutes, now, SENDER_ACK_DEADLINE_MS));
                match result {
                    Ok(seq) => defmt::info!("submitted seq {}", seq),
                    Err(_) => defmt::warn!("rejected: a command is already pending"),
                }
            }
            None => defmt::warn!("unrecognized CLI input: {}", line.as_str()),
        }
    }
}
