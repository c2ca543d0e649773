//! The per-connection handshake: negotiates protocol versions and
//! exchanges node identities and subscription snapshots before any
//! message traffic.

use futures::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use crate::communication::message::{
    self,
    FrameTag,
    HandshakeStatus,
    Reader,
};
use crate::communication::{NodeId, Subscription};
use crate::error::*;

/// What a completed handshake learned about the peer.
#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub id: NodeId,
    pub subscriptions: Vec<Subscription>,
}

/// Runs the dialer side of the handshake on a fresh transport.
///
/// Sends our version, identity and subscription snapshot, then branches
/// on the acceptor's response status.
pub async fn dial<R, W>(
    reader: &mut Reader<R>,
    sink: &mut W,
    version: u64,
    id: NodeId,
    subscriptions: &[Subscription],
) -> Result<PeerInfo>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let request = message::encode_handshake_request(version, id, subscriptions);
    send(sink, &request).await?;

    reader.expect_tag(FrameTag::HandshakeResponse).await?;
    let response = reader.read_handshake_response().await?;

    match response.status {
        HandshakeStatus::Success | HandshakeStatus::BackwardsCompatible => Ok(PeerInfo {
            id: response.id,
            subscriptions: response.subscriptions,
        }),
        HandshakeStatus::RequestCompatibility => {
            // the acceptor is newer and asks whether we can adapt; no
            // backwards compatibility path exists yet, so always refuse
            let fin = message::encode_handshake_final(HandshakeStatus::Incompatible);
            send(sink, &fin).await?;
            Err(incompatible(version, response.version))
        }
        HandshakeStatus::Incompatible => Err(incompatible(version, response.version)),
        HandshakeStatus::GeneralError => Err(Error::wrapped(
            ErrorKind::Communication,
            "peer refused the handshake",
        )),
    }
}

/// Runs the acceptor side of the handshake on a fresh transport.
pub async fn accept<R, W>(
    reader: &mut Reader<R>,
    sink: &mut W,
    version: u64,
    id: NodeId,
    subscriptions: &[Subscription],
) -> Result<PeerInfo>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    reader.expect_tag(FrameTag::HandshakeRequest).await?;
    let request = reader.read_handshake_request().await?;

    if request.version == version {
        let response =
            message::encode_handshake_response(version, id, HandshakeStatus::Success, subscriptions);
        send(sink, &response).await?;
        return Ok(PeerInfo {
            id: request.id,
            subscriptions: request.subscriptions,
        });
    }

    if request.version > version {
        // the dialer is newer than us; hard refusal
        let response = message::encode_handshake_response(
            version,
            id,
            HandshakeStatus::Incompatible,
            subscriptions,
        );
        send(sink, &response).await?;
        return Err(incompatible(version, request.version));
    }

    // the dialer is older; ask whether it can adapt to our version
    let response = message::encode_handshake_response(
        version,
        id,
        HandshakeStatus::RequestCompatibility,
        subscriptions,
    );
    send(sink, &response).await?;

    reader.expect_tag(FrameTag::HandshakeFinal).await?;
    match reader.read_handshake_final().await? {
        HandshakeStatus::Success | HandshakeStatus::BackwardsCompatible => Ok(PeerInfo {
            id: request.id,
            subscriptions: request.subscriptions,
        }),
        _ => Err(incompatible(version, request.version)),
    }
}

async fn send<W: AsyncWrite + Unpin>(sink: &mut W, frame: &[u8]) -> Result<()> {
    sink.write_all(frame).await?;
    sink.flush().await?;
    Ok(())
}

fn incompatible(ours: u64, theirs: u64) -> Error {
    Error::wrapped(
        ErrorKind::IncompatibleVersion,
        format!("local version {}, peer version {}", ours, theirs),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    use futures::io::AsyncReadExt;
    use tokio_util::compat::TokioAsyncReadCompatExt;

    use crate::communication::message::encode_regular;

    type Half = futures::io::ReadHalf<tokio_util::compat::Compat<tokio::io::DuplexStream>>;
    type SinkHalf = futures::io::WriteHalf<tokio_util::compat::Compat<tokio::io::DuplexStream>>;

    fn pipe() -> ((Reader<Half>, SinkHalf), (Reader<Half>, SinkHalf)) {
        let (a, b) = tokio::io::duplex(4096);
        let (ar, aw) = a.compat().split();
        let (br, bw) = b.compat().split();
        ((Reader::new(ar), aw), (Reader::new(br), bw))
    }

    fn sub(channel: &str, key: &str) -> Subscription {
        Subscription::new(channel, key)
    }

    #[tokio::test]
    async fn same_version_succeeds() {
        let ((mut dial_r, mut dial_w), (mut acc_r, mut acc_w)) = pipe();
        let dialer = NodeId::generate();
        let acceptor = NodeId::generate();
        let dialer_subs = vec![sub("test", "key")];

        let (dialed, accepted) = futures::join!(
            dial(&mut dial_r, &mut dial_w, 1, dialer, &dialer_subs),
            accept(&mut acc_r, &mut acc_w, 1, acceptor, &[]),
        );

        let dialed = dialed.unwrap();
        assert_eq!(dialed.id, acceptor);
        assert!(dialed.subscriptions.is_empty());

        let accepted = accepted.unwrap();
        assert_eq!(accepted.id, dialer);
        assert_eq!(accepted.subscriptions, dialer_subs);
    }

    #[tokio::test]
    async fn older_dialer_is_refused_after_final() {
        let ((mut dial_r, mut dial_w), (mut acc_r, mut acc_w)) = pipe();

        let (dialed, accepted) = futures::join!(
            dial(&mut dial_r, &mut dial_w, 1, NodeId::generate(), &[]),
            accept(&mut acc_r, &mut acc_w, 2, NodeId::generate(), &[]),
        );

        assert_eq!(dialed.unwrap_err().kind(), ErrorKind::IncompatibleVersion);
        assert_eq!(accepted.unwrap_err().kind(), ErrorKind::IncompatibleVersion);
    }

    #[tokio::test]
    async fn newer_dialer_is_refused_outright() {
        let ((mut dial_r, mut dial_w), (mut acc_r, mut acc_w)) = pipe();

        let (dialed, accepted) = futures::join!(
            dial(&mut dial_r, &mut dial_w, 2, NodeId::generate(), &[]),
            accept(&mut acc_r, &mut acc_w, 1, NodeId::generate(), &[]),
        );

        assert_eq!(dialed.unwrap_err().kind(), ErrorKind::IncompatibleVersion);
        assert_eq!(accepted.unwrap_err().kind(), ErrorKind::IncompatibleVersion);
    }

    #[tokio::test]
    async fn message_frame_instead_of_request_is_rejected() {
        let ((_dial_r, mut dial_w), (mut acc_r, mut acc_w)) = pipe();

        let rogue = encode_regular(1, "ch", "k", b"hello");
        futures::io::AsyncWriteExt::write_all(&mut dial_w, &rogue)
            .await
            .unwrap();

        let err = accept(&mut acc_r, &mut acc_w, 1, NodeId::generate(), &[])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnexpectedTag);
    }

    #[tokio::test]
    async fn severed_transport_is_a_short_read() {
        let ((dial_r, mut dial_w), (mut acc_r, mut acc_w)) = pipe();

        // a request cut off in the middle of the node id, then EOF
        let request = message::encode_handshake_request(1, NodeId::generate(), &[]);
        futures::io::AsyncWriteExt::write_all(&mut dial_w, &request[..request.len() - 8])
            .await
            .unwrap();
        drop(dial_r);
        drop(dial_w);

        let err = accept(&mut acc_r, &mut acc_w, 1, NodeId::generate(), &[])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ShortRead);
    }
}
