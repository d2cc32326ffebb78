//! v4 message handling
use std::net::Ipv4Addr;

use config::DhcpConfig;
use dhcproto::v4::{DhcpOption, HType, Message, MessageType, Opcode, OptionCode};
use lease_manager::{Allocator, LeaseStore};
use pnet::util::MacAddr;
use tracing::{debug, info, trace, warn};

/// Turns DISCOVER/REQUEST into OFFER/ACK backed by the [`Allocator`].
/// RELEASE and DECLINE are logged and otherwise ignored; the lease runs
/// to its natural end and reclamation takes it from there.
#[derive(Debug)]
pub struct DhcpHandler<S> {
    cfg: DhcpConfig,
    allocator: Allocator<S>,
}

impl<S: LeaseStore> DhcpHandler<S> {
    /// Create a handler serving `allocator`'s range with options from `cfg`
    pub fn new(cfg: DhcpConfig, allocator: Allocator<S>) -> Self {
        Self { cfg, allocator }
    }

    /// Handle one decoded message. `None` means no reply is sent, which
    /// covers both ignorable message types and failed DISCOVERs; a
    /// failed REQUEST gets a NAK.
    pub async fn handle(&self, req: &Message) -> Option<Message> {
        let mac = match client_mac(req) {
            Some(mac) => mac,
            None => {
                trace!(htype = ?req.htype(), "no usable client hardware address, dropping");
                return None;
            }
        };
        match req.opts().msg_type() {
            Some(MessageType::Discover) => self.discover(req, mac).await,
            Some(MessageType::Request) => Some(self.request(req, mac).await),
            Some(MessageType::Release) => {
                info!(%mac, ciaddr = %req.ciaddr(), "got RELEASE, lease kept until expiry");
                None
            }
            Some(MessageType::Decline) => {
                info!(%mac, declined = ?requested_ip(req), "got DECLINE");
                None
            }
            other => {
                debug!(msg_type = ?other, "unsupported message type");
                None
            }
        }
    }

    async fn discover(&self, req: &Message, mac: MacAddr) -> Option<Message> {
        match self.allocator.allocate(mac, true, None).await {
            Ok(ip) => Some(self.reply(req, MessageType::Offer, ip)),
            Err(err) => {
                warn!(%mac, %err, "DISCOVER failed, dropping");
                None
            }
        }
    }

    async fn request(&self, req: &Message, mac: MacAddr) -> Message {
        match self.allocator.allocate(mac, true, requested_ip(req)).await {
            Ok(ip) => self.reply(req, MessageType::Ack, ip),
            Err(err) => {
                warn!(%mac, %err, "REQUEST failed, sending NAK");
                self.nak(req)
            }
        }
    }

    fn reply(&self, req: &Message, msg_type: MessageType, yiaddr: Ipv4Addr) -> Message {
        let mut resp = util::new_msg(req, self.cfg.interface_ip());
        resp.set_yiaddr(yiaddr);
        let opts = resp.opts_mut();
        opts.insert(DhcpOption::MessageType(msg_type));
        opts.insert(DhcpOption::ServerIdentifier(self.cfg.interface_ip()));
        opts.insert(DhcpOption::SubnetMask(self.cfg.subnet_mask()));
        opts.insert(DhcpOption::Router(vec![self.cfg.gateway()]));
        opts.insert(DhcpOption::AddressLeaseTime(lease_secs(&self.cfg)));
        if !self.cfg.dns_servers().is_empty() {
            opts.insert(DhcpOption::DomainNameServer(
                self.cfg.dns_servers().to_vec(),
            ));
        }
        if !self.cfg.domain_search().is_empty() {
            opts.insert(DhcpOption::DomainSearch(self.cfg.domain_search().to_vec()));
        }
        resp
    }

    fn nak(&self, req: &Message) -> Message {
        let mut resp = util::new_msg(req, self.cfg.interface_ip());
        resp.opts_mut()
            .insert(DhcpOption::MessageType(MessageType::Nak));
        resp.opts_mut()
            .insert(DhcpOption::ServerIdentifier(self.cfg.interface_ip()));
        resp
    }
}

/// lease duration as the u32 of seconds option 51 carries
fn lease_secs(cfg: &DhcpConfig) -> u32 {
    u32::try_from(cfg.lease_duration().as_secs()).unwrap_or(u32::MAX)
}

/// MAC from the chaddr header field. Only ethernet is served.
fn client_mac(req: &Message) -> Option<MacAddr> {
    let chaddr = req.chaddr();
    if req.htype() != HType::Eth || chaddr.len() < 6 {
        return None;
    }
    Some(MacAddr::new(
        chaddr[0], chaddr[1], chaddr[2], chaddr[3], chaddr[4], chaddr[5],
    ))
}

/// option 50 if present, otherwise a non-zero ciaddr
fn requested_ip(req: &Message) -> Option<Ipv4Addr> {
    if let Some(DhcpOption::RequestedIpAddress(ip)) = req.opts().get(OptionCode::RequestedIpAddress)
    {
        return Some(*ip);
    }
    if !req.ciaddr().is_unspecified() {
        return Some(req.ciaddr());
    }
    None
}

pub(crate) mod util {
    use super::*;

    /// start a reply from `req`, echoing the header fields RFC 2131
    /// says the server copies back
    pub(crate) fn new_msg(req: &Message, siaddr: Ipv4Addr) -> Message {
        let mut msg = Message::new_with_id(
            req.xid(),
            Ipv4Addr::UNSPECIFIED,
            Ipv4Addr::UNSPECIFIED,
            siaddr,
            req.giaddr(),
            req.chaddr(),
        );
        msg.set_opcode(Opcode::BootReply)
            .set_htype(req.htype())
            .set_flags(req.flags())
            .set_hops(req.hops());
        msg
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use dhcproto::v4::Flags;
    use lease_manager::memory::MemoryStore;

    use super::*;

    static SAMPLE_YAML: &str = include_str!("../../libs/config/sample/config.yaml");

    const MAC_A: MacAddr = MacAddr(0x00, 0x11, 0x22, 0x33, 0x44, 0x55);

    fn handler() -> DhcpHandler<MemoryStore> {
        let cfg = DhcpConfig::parse_str(SAMPLE_YAML).expect("sample config parses");
        let allocator = Allocator::new(
            MemoryStore::new(),
            cfg.dynamic_range(),
            cfg.lease_duration(),
            cfg.grace_period(),
        );
        DhcpHandler::new(cfg, allocator)
    }

    fn msg(mac: MacAddr, msg_type: MessageType) -> Message {
        let mut msg = Message::default();
        msg.set_opcode(Opcode::BootRequest)
            .set_htype(HType::Eth)
            .set_flags(Flags::default().set_broadcast())
            .set_chaddr(&mac.octets());
        msg.opts_mut().insert(DhcpOption::MessageType(msg_type));
        msg
    }

    #[tokio::test]
    async fn test_discover_gets_offer() {
        let handler = handler();
        let resp = handler
            .handle(&msg(MAC_A, MessageType::Discover))
            .await
            .expect("offer");

        assert_eq!(resp.opcode(), Opcode::BootReply);
        assert_eq!(resp.opts().msg_type(), Some(MessageType::Offer));
        assert_eq!(resp.yiaddr(), Ipv4Addr::new(10, 0, 20, 50));
        assert_eq!(
            resp.opts().get(OptionCode::ServerIdentifier),
            Some(&DhcpOption::ServerIdentifier(Ipv4Addr::new(10, 0, 20, 1)))
        );
        assert_eq!(
            resp.opts().get(OptionCode::SubnetMask),
            Some(&DhcpOption::SubnetMask(Ipv4Addr::new(255, 255, 255, 0)))
        );
        assert_eq!(
            resp.opts().get(OptionCode::AddressLeaseTime),
            Some(&DhcpOption::AddressLeaseTime(
                Duration::from_secs(86400).as_secs() as u32
            ))
        );
        assert!(resp.opts().get(OptionCode::DomainNameServer).is_some());
        assert!(resp.opts().get(OptionCode::DomainSearch).is_some());
    }

    #[tokio::test]
    async fn test_request_after_discover_acks_same_ip() {
        let handler = handler();
        let offer = handler
            .handle(&msg(MAC_A, MessageType::Discover))
            .await
            .expect("offer");

        let mut req = msg(MAC_A, MessageType::Request);
        req.opts_mut()
            .insert(DhcpOption::RequestedIpAddress(offer.yiaddr()));
        let ack = handler.handle(&req).await.expect("ack");
        assert_eq!(ack.opts().msg_type(), Some(MessageType::Ack));
        assert_eq!(ack.yiaddr(), offer.yiaddr());
    }

    #[tokio::test]
    async fn test_requested_ip_does_not_steer_allocation() {
        let handler = handler();
        let mut req = msg(MAC_A, MessageType::Request);
        req.opts_mut()
            .insert(DhcpOption::RequestedIpAddress(Ipv4Addr::new(10, 0, 20, 99)));
        let ack = handler.handle(&req).await.expect("ack");
        assert_eq!(ack.opts().msg_type(), Some(MessageType::Ack));
        assert_eq!(ack.yiaddr(), Ipv4Addr::new(10, 0, 20, 50));
    }

    #[tokio::test]
    async fn test_exhausted_request_naks() {
        let cfg = DhcpConfig::parse_str(SAMPLE_YAML).expect("sample config parses");
        let range = config::Range::new(
            Ipv4Addr::new(10, 0, 20, 50),
            Ipv4Addr::new(10, 0, 20, 50),
        )
        .unwrap();
        let allocator = Allocator::new(
            MemoryStore::new(),
            range,
            cfg.lease_duration(),
            cfg.grace_period(),
        );
        let handler = DhcpHandler::new(cfg, allocator);

        handler
            .handle(&msg(MAC_A, MessageType::Discover))
            .await
            .expect("offer");
        // range is now full and the holder's lease is valid
        let other = MacAddr(0x66, 0x77, 0x88, 0x99, 0xaa, 0xbb);
        let resp = handler.handle(&msg(other, MessageType::Request)).await;
        assert_eq!(
            resp.expect("nak").opts().msg_type(),
            Some(MessageType::Nak)
        );
        // a failed DISCOVER stays silent
        assert!(handler
            .handle(&msg(other, MessageType::Discover))
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_release_and_decline_are_silent() {
        let handler = handler();
        handler
            .handle(&msg(MAC_A, MessageType::Discover))
            .await
            .expect("offer");
        assert!(handler
            .handle(&msg(MAC_A, MessageType::Release))
            .await
            .is_none());
        assert!(handler
            .handle(&msg(MAC_A, MessageType::Decline))
            .await
            .is_none());
        // the binding survives
        let req = handler
            .handle(&msg(MAC_A, MessageType::Request))
            .await
            .expect("ack");
        assert_eq!(req.opts().msg_type(), Some(MessageType::Ack));
    }

    #[tokio::test]
    async fn test_non_ethernet_dropped() {
        let handler = handler();
        let mut req = msg(MAC_A, MessageType::Discover);
        req.set_htype(HType::Chaos);
        assert!(handler.handle(&req).await.is_none());
    }

    #[tokio::test]
    async fn test_message_without_type_dropped() {
        let handler = handler();
        let mut req = msg(MAC_A, MessageType::Discover);
        req.opts_mut().remove(OptionCode::MessageType);
        assert!(handler.handle(&req).await.is_none());
    }
}
