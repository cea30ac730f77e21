//! USB interrupt dispatcher.
//!
//! `on_interrupt` is the body of the USB interrupt handler. It reads the
//! pending causes once and services them in a fixed order: endpoint
//! transfers, bus reset, wakeup, suspend, start-of-frame, missed
//! start-of-frame. EP0 events are drained completely; every other endpoint
//! is serviced at most once per entry so a busy bulk pipe cannot starve
//! the rest of the handler.

use crate::usb::class::{EndpointBus, EndpointIo};
use crate::usb::control::{InEvent, OutEvent};
use crate::usb::device::{DeviceState, UsbDevice};
use crate::usb::endpoint::Direction;
use crate::usb::hw::{Interrupts, TransferEvent, UsbPeripheral};

impl<P: UsbPeripheral> UsbDevice<'_, P> {
    /// Service every pending interrupt cause.
    pub fn on_interrupt(&mut self) {
        let irq = self.hw.interrupts();
        if !self.enabled {
            self.hw.clear_interrupts(irq);
            return;
        }

        if irq.transfer {
            self.service_transfers();
        }

        if irq.reset {
            self.hw.clear_interrupts(Interrupts {
                reset: true,
                ..Interrupts::NONE
            });
            info!("USB: reset");
            self.bus_reset();
        }

        if irq.wakeup {
            self.hw.clear_interrupts(Interrupts {
                wakeup: true,
                ..Interrupts::NONE
            });
            self.suspend.host_resume(&mut self.hw);
        }

        if irq.suspend {
            self.hw.clear_interrupts(Interrupts {
                suspend: true,
                ..Interrupts::NONE
            });
            self.suspend.suspend(&mut self.hw);
        }

        if irq.sof {
            self.hw.clear_interrupts(Interrupts {
                sof: true,
                ..Interrupts::NONE
            });
            self.start_of_frame();
        }

        if irq.esof {
            self.hw.clear_interrupts(Interrupts {
                esof: true,
                ..Interrupts::NONE
            });
            self.suspend.frame_tick(&mut self.hw);
        }

        if irq.error || irq.pma_overrun {
            self.hw.clear_interrupts(Interrupts {
                error: true,
                pma_overrun: true,
                ..Interrupts::NONE
            });
            debug!("USB: error {} overrun {}", irq.error, irq.pma_overrun);
        }
    }

    fn service_transfers(&mut self) {
        // Bit n set once endpoint n was serviced in this entry.
        let mut served: u32 = 0;

        while let Some(event) = self.hw.pending_transfer() {
            if event.address == 0 {
                self.service_control(event);
                continue;
            }
            let bit = 1u32 << event.address;
            if served & bit != 0 {
                break;
            }
            served |= bit;
            self.service_endpoint(event.address);
        }
    }

    fn service_control(&mut self, event: TransferEvent) {
        match (event.direction, event.setup) {
            (Direction::In, _) => {
                self.hw.clear_transfer_complete(0, Direction::In);
                let done = self.pipe.in_complete(&mut self.hw, self.descriptor.as_ref());
                if done == InEvent::StatusSent {
                    self.apply_pending_address();
                }
            }
            (Direction::Out, true) => {
                self.hw.clear_transfer_complete(0, Direction::Out);
                self.control_setup();
            }
            (Direction::Out, false) => {
                self.hw.clear_transfer_complete(0, Direction::Out);
                if self.pipe.out_complete(&mut self.hw) == OutEvent::DataReceived {
                    self.control_data_received();
                }
            }
        }
    }

    /// Both halves of one endpoint register.
    fn service_endpoint(&mut self, address: u8) {
        for dir in [Direction::Out, Direction::In] {
            if !self.hw.transfer_complete(address, dir) {
                continue;
            }
            self.hw.clear_transfer_complete(address, dir);

            let Some(alloc) = self.alloc.as_ref() else {
                continue;
            };
            let Some(route) = alloc.route(address, dir) else {
                warn!("USB: transfer on unrouted endpoint {}", address);
                continue;
            };
            let ep = &alloc.endpoints()[route.index];
            let Some(module) = self.modules.get_mut(route.module) else {
                continue;
            };
            let mut io = EndpointIo::new(&mut self.hw, ep);
            match dir {
                Direction::In => module.on_in_complete(route.slot, &mut io),
                Direction::Out => module.on_out_complete(route.slot, &mut io),
            }
        }
    }

    fn start_of_frame(&mut self) {
        if self.state != DeviceState::Configured {
            return;
        }
        let Some(alloc) = self.alloc.as_ref() else {
            return;
        };
        for (index, module) in self.modules.iter_mut().enumerate() {
            let mut bus = EndpointBus::new(&mut self.hw, alloc.module_endpoints(index));
            module.on_start_of_frame(&mut bus);
        }
    }
}
