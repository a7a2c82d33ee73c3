//! Routes incoming packets to per-kind writers by packet flags.
//!
//! A session registers one route for audio (source) packets and one for
//! repair packets. The router learns the source id of the first packet on
//! each route so later stages can validate stream identity.

use log::debug;

use super::{flags, PacketPtr, PacketWriter};
use crate::status::Status;

struct Route {
    writer: Box<dyn PacketWriter + Send>,
    flag_mask: u32,
    source_id: Option<u32>,
}

/// Flag-based packet demultiplexer.
pub struct Router {
    routes: Vec<Route>,
}

impl Router {
    pub fn new() -> Self {
        Self { routes: Vec::new() }
    }

    /// Register a writer for packets carrying all bits of `flag_mask`.
    pub fn add_route(&mut self, writer: Box<dyn PacketWriter + Send>, flag_mask: u32) {
        self.routes.push(Route {
            writer,
            flag_mask,
            source_id: None,
        });
    }

    /// Source id learned for the route matching `flag_mask`, if any.
    pub fn source_id(&self, flag_mask: u32) -> Option<u32> {
        self.routes
            .iter()
            .find(|r| r.flag_mask == flag_mask)
            .and_then(|r| r.source_id)
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketWriter for Router {
    fn write(&mut self, packet: PacketPtr) -> Result<(), Status> {
        for route in &mut self.routes {
            if !packet.has_flags(route.flag_mask) {
                continue;
            }
            if route.source_id.is_none() {
                route.source_id = packet.rtp().map(|r| r.source_id);
                if let Some(id) = route.source_id {
                    debug!(
                        "router: learned source id {:#x} for flags {:#x}",
                        id, route.flag_mask
                    );
                }
            }
            return route.writer.write(packet);
        }

        debug!(
            "router: no route for packet flags {:#x}, dropping",
            packet.flags()
        );
        Err(Status::NoRoute)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::sorted_queue::SharedQueue;
    use crate::packet::{FecFields, Packet, PacketFactory, RtpFields};

    fn audio_packet(factory: &PacketFactory, sn: u16, ssrc: u32) -> PacketPtr {
        Packet::new(
            factory.buffer_from(&[0u8; 4]).unwrap(),
            flags::RTP | flags::AUDIO,
            Some(RtpFields {
                source_id: ssrc,
                seqnum: sn,
                stream_timestamp: 0,
                marker: false,
                payload_type: 96,
                duration: 4,
                payload: 0..4,
            }),
            None,
            0,
        )
    }

    fn repair_packet(factory: &PacketFactory) -> PacketPtr {
        Packet::new(
            factory.buffer_from(&[0u8; 4]).unwrap(),
            flags::FEC | flags::REPAIR,
            None,
            Some(FecFields {
                source_block_number: 0,
                encoding_symbol_id: 10,
                source_block_length: 10,
                block_length: 15,
                payload: 0..4,
            }),
            0,
        )
    }

    #[test]
    fn test_routes_by_flags() {
        let factory = PacketFactory::new(16);
        let source_q = SharedQueue::new(0);
        let repair_q = SharedQueue::new(0);

        let mut router = Router::new();
        router.add_route(Box::new(source_q.clone()), flags::AUDIO);
        router.add_route(Box::new(repair_q.clone()), flags::REPAIR);

        router.write(audio_packet(&factory, 1, 0xabc)).unwrap();
        router.write(repair_packet(&factory)).unwrap();

        assert_eq!(source_q.len(), 1);
        assert_eq!(repair_q.len(), 1);
    }

    #[test]
    fn test_learns_source_id() {
        let factory = PacketFactory::new(16);
        let mut router = Router::new();
        router.add_route(Box::new(SharedQueue::new(0)), flags::AUDIO);

        assert_eq!(router.source_id(flags::AUDIO), None);
        router.write(audio_packet(&factory, 1, 0xdead)).unwrap();
        assert_eq!(router.source_id(flags::AUDIO), Some(0xdead));
    }

    #[test]
    fn test_no_route() {
        let factory = PacketFactory::new(16);
        let mut router = Router::new();
        router.add_route(Box::new(SharedQueue::new(0)), flags::AUDIO);

        let err = router.write(repair_packet(&factory)).unwrap_err();
        assert_eq!(err, Status::NoRoute);
    }
}
