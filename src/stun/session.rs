/**
 * STUN session: builds outgoing messages, attaches credentials, runs one
 * client transaction per request and demultiplexes inbound traffic.
 */
use std::{collections::HashMap, net::SocketAddr, rc::Rc, time::Duration};

use slog::{debug, o, trace, Logger};

use super::{
    attribute_type::ATTR_SOFTWARE,
    error_code, method,
    transaction::{ClientTransaction, RetransmitConfig},
    Attribute, EncodeOptions, MessageClass, StunMessage, TransactionId,
};
use crate::{
    auth::{self, AuthKind, Credential},
    config::Settings,
    error::Error,
    transport::{TimerHandle, TimerService, Transport},
    utils, Result,
};

/**
 * Per-session protocol settings.
 *
 * Fields:
 * - `rto`: Initial retransmission timeout.
 * - `max_transmit`: Total transmissions of a request over UDP.
 * - `software`: Value of the SOFTWARE attribute, `None` to omit it.
 * - `fingerprint`: Append FINGERPRINT to every outgoing message.
 */
#[derive(Debug, Clone)]
pub struct StunConfig {
    pub rto: Duration,
    pub max_transmit: u32,
    pub software: Option<String>,
    pub fingerprint: bool,
}

impl Default for StunConfig {
    fn default() -> Self {
        Self {
            rto: Duration::from_millis(500),
            max_transmit: 7,
            software: None,
            fingerprint: true,
        }
    }
}

impl From<&Settings> for StunConfig {
    fn from(cfg: &Settings) -> Self {
        Self {
            rto: Duration::from_millis(cfg.rto_ms),
            max_transmit: cfg.max_transmit,
            software: Some(cfg.software_name.clone()).filter(|s| !s.is_empty()),
            fingerprint: cfg.use_fingerprint,
        }
    }
}

/**
 * A message on its way out, plus the caller's tag for requests. The tag comes
 * back in the `Completion` of the request.
 */
#[derive(Debug, Clone)]
pub struct TxData<T> {
    pub message: StunMessage,
    pub tag: Option<T>,
}

impl<T> TxData<T> {
    pub fn transaction_id(&self) -> TransactionId {
        self.message.transaction_id
    }
}

/**
 * Fields:
 * - `dest`: Where to send the message.
 * - `authenticate`: Attach the session credential and MESSAGE-INTEGRITY.
 * - `retransmit`: Retransmit requests (false over reliable transports).
 */
#[derive(Debug, Clone, Copy)]
pub struct SendOptions {
    pub dest: SocketAddr,
    pub authenticate: bool,
    pub retransmit: bool,
}

impl SendOptions {
    pub fn new(dest: SocketAddr) -> Self {
        Self {
            dest,
            authenticate: true,
            retransmit: true,
        }
    }
}

/**
 * The single outcome of a request.
 *
 * Fields:
 * - `tag`: The tag given when the request was created.
 * - `status`: `Ok` for a success response, the mapped error otherwise.
 * - `response`: The final response, absent on timeout or transport failure.
 * - `src`: Where the response came from.
 */
#[derive(Debug, Clone)]
pub struct Completion<T> {
    pub tag: T,
    pub transaction_id: TransactionId,
    pub method: u16,
    pub status: Result<()>,
    pub response: Option<StunMessage>,
    pub src: Option<SocketAddr>,
}

/**
 * Receives what the session produces while processing an event. Invoked
 * synchronously from `send`, `on_rx_packet` and `on_timer`.
 */
pub trait StunHandler<T> {
    fn on_request_complete(&mut self, completion: Completion<T>);

    /// An inbound request. Any answer goes back through `StunSession::send`.
    fn on_rx_request(&mut self, _request: StunMessage, _src: SocketAddr) {}

    fn on_rx_indication(&mut self, _indication: StunMessage, _src: SocketAddr) {}
}

struct PendingRequest<T> {
    tsx: ClientTransaction,
    tag: T,
    method: u16,
    key: Option<Vec<u8>>,
}

pub struct StunSession<T> {
    config: StunConfig,
    logger: Logger,
    transport: Rc<dyn Transport>,
    timers: Rc<dyn TimerService>,
    auth_kind: AuthKind,
    credential: Option<Credential>,
    realm: Option<String>,
    nonce: Option<String>,
    transactions: HashMap<TransactionId, PendingRequest<T>>,
}

impl<T> StunSession<T> {
    pub fn new(
        config: StunConfig,
        logger: &Logger,
        transport: Rc<dyn Transport>,
        timers: Rc<dyn TimerService>,
    ) -> Self {
        Self {
            config,
            logger: logger.new(o!("layer" => "stun")),
            transport,
            timers,
            auth_kind: AuthKind::None,
            credential: None,
            realm: None,
            nonce: None,
            transactions: HashMap::new(),
        }
    }

    /**
     * Replace the credential. Takes effect for requests sent from now on,
     * transactions already in flight keep the key they were signed with.
     */
    pub fn set_credential(&mut self, kind: AuthKind, credential: Option<Credential>) {
        if let Some(Credential::Static(s)) = &credential {
            self.realm = s.realm.clone();
            self.nonce = s.nonce.clone();
        } else {
            self.realm = None;
            self.nonce = None;
        }
        self.auth_kind = kind;
        self.credential = credential;
    }

    pub fn auth_kind(&self) -> AuthKind {
        self.auth_kind
    }

    pub fn realm(&self) -> Option<&str> {
        self.realm.as_deref()
    }

    pub fn nonce(&self) -> Option<&str> {
        self.nonce.as_deref()
    }

    pub fn config(&self) -> &StunConfig {
        &self.config
    }

    pub fn pending_count(&self) -> usize {
        self.transactions.len()
    }

    pub fn is_pending(&self, transaction_id: &TransactionId) -> bool {
        self.transactions.contains_key(transaction_id)
    }

    /**
     * A new request with a transaction ID not used by any live transaction.
     */
    pub fn create_request(&self, method: u16, tag: T) -> TxData<T> {
        let mut transaction_id = StunMessage::new_transaction_id();
        while self.transactions.contains_key(&transaction_id) {
            transaction_id = StunMessage::new_transaction_id();
        }
        TxData {
            message: StunMessage::new(method, MessageClass::Request, transaction_id),
            tag: Some(tag),
        }
    }

    pub fn create_indication(&self, method: u16) -> TxData<T> {
        TxData {
            message: StunMessage::new(
                method,
                MessageClass::Indication,
                StunMessage::new_transaction_id(),
            ),
            tag: None,
        }
    }

    pub fn create_response(&self, request: &StunMessage, class: MessageClass) -> TxData<T> {
        TxData {
            message: StunMessage::response_to(request, class),
            tag: None,
        }
    }

    /**
     * Attach credentials and SOFTWARE, encode and send. A request starts a
     * client transaction whose outcome is reported to the handler given to
     * later `on_rx_packet`/`on_timer` calls.
     *
     * @return The transaction ID of the message.
     */
    pub fn send(&mut self, tx: TxData<T>, options: &SendOptions) -> Result<TransactionId> {
        let TxData { mut message, tag } = tx;
        let transaction_id = message.transaction_id;
        let is_request = message.class == MessageClass::Request;

        if is_request && self.transactions.contains_key(&transaction_id) {
            return Err(Error::InvalidOperation("transaction ID already in use"));
        }

        let key = if options.authenticate {
            self.attach_credential(&mut message)?
        } else {
            None
        };
        if let Some(software) = &self.config.software {
            if !message.has_attribute(ATTR_SOFTWARE) {
                message.add_attribute(Attribute::Software(software.clone()));
            }
        }

        let bytes = message.encode(&EncodeOptions {
            integrity_key: key.as_deref(),
            fingerprint: self.config.fingerprint,
        })?;
        trace!(
            self.logger,
            "--<-- [{}] {} {:?} to {}: {}",
            hex::encode(transaction_id),
            method::name(message.method),
            message.class,
            options.dest,
            utils::packet_dump(&bytes)
        );

        if !is_request {
            self.transport.send(&bytes, options.dest)?;
            return Ok(transaction_id);
        }

        let tag = tag.ok_or(Error::InvalidOperation("request without a tag"))?;
        let mut tsx = ClientTransaction::new(
            transaction_id,
            options.dest,
            RetransmitConfig {
                rto: self.config.rto,
                max_transmit: self.config.max_transmit,
            },
            options.retransmit,
        );
        tsx.send(bytes, self.transport.as_ref(), self.timers.as_ref())?;
        self.transactions.insert(
            transaction_id,
            PendingRequest {
                tsx,
                tag,
                method: message.method,
                key,
            },
        );
        Ok(transaction_id)
    }

    /**
     * Add USERNAME (and REALM/NONCE for long-term credentials) and return the
     * MESSAGE-INTEGRITY key. A long-term request sent before the server has
     * issued a nonce goes out unauthenticated to obtain the challenge.
     */
    fn attach_credential(&self, message: &mut StunMessage) -> Result<Option<Vec<u8>>> {
        let Some(credential) = &self.credential else {
            return Ok(None);
        };
        message.attributes.retain(|a| {
            !matches!(
                a,
                Attribute::Username(_) | Attribute::Realm(_) | Attribute::Nonce(_)
            )
        });

        match self.auth_kind {
            AuthKind::None => Ok(None),
            AuthKind::ShortTerm => {
                let Some(info) = credential.resolve(None) else {
                    debug!(self.logger, "No short-term credential, sending unauthenticated");
                    return Ok(None);
                };
                message.add_attribute(Attribute::Username(info.username.clone()));
                Ok(Some(auth::derive_key(AuthKind::ShortTerm, None, &info)))
            }
            AuthKind::LongTerm => {
                let Some(nonce) = &self.nonce else {
                    return Ok(None);
                };
                let realm = self.realm.as_deref();
                let Some(info) = credential.resolve(realm) else {
                    debug!(
                        self.logger,
                        "No credential for realm {:?}, sending unauthenticated", realm
                    );
                    return Ok(None);
                };
                message.add_attribute(Attribute::Username(info.username.clone()));
                if let Some(realm) = realm {
                    message.add_attribute(Attribute::Realm(realm.to_string()));
                }
                message.add_attribute(Attribute::Nonce(nonce.clone()));
                Ok(Some(auth::derive_key(AuthKind::LongTerm, realm, &info)))
            }
        }
    }

    /**
     * Process one inbound STUN packet. Malformed packets and responses that
     * fail MESSAGE-INTEGRITY are dropped and leave every transaction as it
     * was, the returned error only tells the caller why.
     */
    pub fn on_rx_packet(
        &mut self,
        bytes: &[u8],
        src: SocketAddr,
        handler: &mut dyn StunHandler<T>,
    ) -> Result<()> {
        let message = match StunMessage::parse(bytes) {
            Ok(message) => message,
            Err(e) => {
                debug!(self.logger, "Dropping packet from {}: {}", src, e);
                return Err(e);
            }
        };
        trace!(
            self.logger,
            "-->-- [{}] {} {:?} from {}: {}",
            hex::encode(message.transaction_id),
            method::name(message.method),
            message.class,
            src,
            utils::packet_dump(bytes)
        );

        match message.class {
            MessageClass::Request => {
                handler.on_rx_request(message, src);
                Ok(())
            }
            MessageClass::Indication => {
                handler.on_rx_indication(message, src);
                Ok(())
            }
            MessageClass::SuccessResponse | MessageClass::ErrorResponse => {
                self.on_rx_response(message, bytes, src, handler)
            }
        }
    }

    fn on_rx_response(
        &mut self,
        message: StunMessage,
        bytes: &[u8],
        src: SocketAddr,
        handler: &mut dyn StunHandler<T>,
    ) -> Result<()> {
        let transaction_id = message.transaction_id;
        let Some(pending) = self.transactions.get_mut(&transaction_id) else {
            debug!(
                self.logger,
                "Response [{}] matches no transaction",
                hex::encode(transaction_id)
            );
            return Ok(());
        };

        if let Some(key) = &pending.key {
            if auth::requires_integrity(&message) {
                let valid = auth::verify_message_integrity(key, bytes).unwrap_or(false);
                if !valid {
                    pending.tsx.mark_integrity_failure();
                    debug!(
                        self.logger,
                        "Response [{}] failed MESSAGE-INTEGRITY, ignored",
                        hex::encode(transaction_id)
                    );
                    return Err(Error::Auth("MESSAGE-INTEGRITY mismatch".into()));
                }
            }
        }

        let Some(status) = pending.tsx.on_response(&message, self.timers.as_ref()) else {
            return Ok(());
        };

        if let Some((code, _)) = message.error_code() {
            if code == error_code::UNAUTHORIZED || code == error_code::STALE_NONCE {
                self.update_challenge(&message);
            }
        }

        if let Some(pending) = self.transactions.remove(&transaction_id) {
            handler.on_request_complete(Completion {
                tag: pending.tag,
                transaction_id,
                method: pending.method,
                status,
                response: Some(message),
                src: Some(src),
            });
        }
        Ok(())
    }

    /**
     * Take REALM/NONCE from a 401 or 438 challenge. The request is not resent
     * here, the caller decides whether to retry.
     */
    fn update_challenge(&mut self, message: &StunMessage) {
        if let Some(realm) = message.realm() {
            self.realm = Some(realm.to_string());
        }
        if let Some(nonce) = message.nonce() {
            self.nonce = Some(nonce.to_string());
        }
        if let Some(Credential::Static(s)) = &mut self.credential {
            s.realm = self.realm.clone();
            s.nonce = self.nonce.clone();
        }
        debug!(
            self.logger,
            "Challenge received, realm={:?} nonce={:?}", self.realm, self.nonce
        );
    }

    /**
     * Handle an expired timer.
     *
     * @return false when the timer belongs to no transaction of this session.
     */
    pub fn on_timer(&mut self, handle: TimerHandle, handler: &mut dyn StunHandler<T>) -> bool {
        let Some(transaction_id) = self
            .transactions
            .iter()
            .find(|(_, p)| p.tsx.timer() == Some(handle))
            .map(|(id, _)| *id)
        else {
            return false;
        };

        let outcome = match self.transactions.get_mut(&transaction_id) {
            Some(pending) => pending
                .tsx
                .on_timer(self.transport.as_ref(), self.timers.as_ref()),
            None => None,
        };
        if let Some(status) = outcome {
            if let Some(pending) = self.transactions.remove(&transaction_id) {
                debug!(
                    self.logger,
                    "Transaction [{}] {} failed: {:?}",
                    hex::encode(transaction_id),
                    method::name(pending.method),
                    status
                );
                handler.on_request_complete(Completion {
                    tag: pending.tag,
                    transaction_id,
                    method: pending.method,
                    status,
                    response: None,
                    src: None,
                });
            }
        }
        true
    }

    /**
     * Cancel one request. No completion is reported for it.
     *
     * @return The request's tag, or `None` if it was not pending.
     */
    pub fn cancel(&mut self, transaction_id: &TransactionId) -> Option<T> {
        let mut pending = self.transactions.remove(transaction_id)?;
        pending.tsx.cancel(self.timers.as_ref());
        Some(pending.tag)
    }

    /**
     * Cancel every live transaction without reporting completions.
     */
    pub fn destroy(&mut self) {
        for (_, mut pending) in self.transactions.drain() {
            pending.tsx.cancel(self.timers.as_ref());
        }
    }
}

impl<T> Drop for StunSession<T> {
    fn drop(&mut self) {
        self.destroy();
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use std::cell::{Cell, RefCell};

    use crate::auth::{CredentialInfo, DynamicCredential, PasswordKind, StaticCredential};
    use crate::stun::attribute_type::{
        ATTR_FINGERPRINT, ATTR_MESSAGE_INTEGRITY, ATTR_NONCE, ATTR_REALM, ATTR_USERNAME,
        ATTR_XOR_MAPPED_ADDRESS,
    };
    use crate::testing::{test_logger, MockTimers, MockTransport};

    #[derive(Default)]
    struct Recorder {
        completions: Vec<Completion<u32>>,
        requests: Vec<StunMessage>,
        indications: Vec<StunMessage>,
    }

    impl StunHandler<u32> for Recorder {
        fn on_request_complete(&mut self, completion: Completion<u32>) {
            self.completions.push(completion);
        }

        fn on_rx_request(&mut self, request: StunMessage, _src: SocketAddr) {
            self.requests.push(request);
        }

        fn on_rx_indication(&mut self, indication: StunMessage, _src: SocketAddr) {
            self.indications.push(indication);
        }
    }

    fn server() -> SocketAddr {
        "192.0.2.1:3478".parse().unwrap()
    }

    fn setup() -> (StunSession<u32>, Rc<MockTransport>, Rc<MockTimers>) {
        let transport = Rc::new(MockTransport::new());
        let timers = Rc::new(MockTimers::new());
        let config = StunConfig {
            software: Some("SYN_TURN/1".into()),
            ..StunConfig::default()
        };
        let session = StunSession::new(config, &test_logger(), transport.clone(), timers.clone());
        (session, transport, timers)
    }

    fn success_for(request: &StunMessage, key: Option<&[u8]>) -> Vec<u8> {
        StunMessage::response_to(request, MessageClass::SuccessResponse)
            .with(Attribute::XorMappedAddress("198.51.100.7:40000".parse().unwrap()))
            .encode(&EncodeOptions {
                integrity_key: key,
                fingerprint: true,
            })
            .unwrap()
    }

    #[test]
    fn test_live_transaction_ids_are_unique() {
        let (mut session, transport, _timers) = setup();
        let mut ids = HashSet::new();
        for i in 0..200 {
            let tx = session.create_request(method::BINDING, i);
            let id = session.send(tx, &SendOptions::new(server())).unwrap();
            assert!(ids.insert(id));
        }
        assert_eq!(session.pending_count(), 200);
        assert_eq!(transport.sent_count(), 200);
    }

    #[test]
    fn test_reusing_live_transaction_id_is_rejected() {
        let (mut session, _transport, _timers) = setup();
        let tx = session.create_request(method::BINDING, 1);
        let duplicate = TxData {
            message: tx.message.clone(),
            tag: Some(2),
        };
        session.send(tx, &SendOptions::new(server())).unwrap();
        assert!(matches!(
            session.send(duplicate, &SendOptions::new(server())),
            Err(Error::InvalidOperation(_))
        ));
    }

    #[test]
    fn test_request_carries_software_and_fingerprint() {
        let (mut session, transport, _timers) = setup();
        let tx = session.create_request(method::BINDING, 1);
        session.send(tx, &SendOptions::new(server())).unwrap();

        let (msg, dest) = transport.last_message().unwrap();
        assert_eq!(dest, server());
        assert_eq!(msg.class, MessageClass::Request);
        assert_eq!(
            msg.find_attribute(ATTR_SOFTWARE),
            Some(&Attribute::Software("SYN_TURN/1".into()))
        );
        assert!(msg.has_attribute(ATTR_FINGERPRINT));
        assert!(!msg.has_attribute(ATTR_MESSAGE_INTEGRITY));
    }

    #[test]
    fn test_response_completes_exactly_once() {
        let (mut session, transport, timers) = setup();
        let mut recorder = Recorder::default();
        let tx = session.create_request(method::BINDING, 42);
        session.send(tx, &SendOptions::new(server())).unwrap();
        let (request, _) = transport.last_message().unwrap();

        let response = success_for(&request, None);
        session.on_rx_packet(&response, server(), &mut recorder).unwrap();
        session.on_rx_packet(&response, server(), &mut recorder).unwrap();

        assert_eq!(recorder.completions.len(), 1);
        let completion = &recorder.completions[0];
        assert_eq!(completion.tag, 42);
        assert_eq!(completion.status, Ok(()));
        assert_eq!(
            completion.response.as_ref().unwrap().address(ATTR_XOR_MAPPED_ADDRESS),
            Some("198.51.100.7:40000".parse().unwrap())
        );
        assert_eq!(session.pending_count(), 0);
        assert_eq!(timers.pending(), 0);
    }

    #[test]
    fn test_timeout_completes_once() {
        let (mut session, transport, timers) = setup();
        let mut recorder = Recorder::default();
        let tx = session.create_request(method::BINDING, 7);
        session.send(tx, &SendOptions::new(server())).unwrap();

        while let Some(handle) = timers.fire_next() {
            assert!(session.on_timer(handle, &mut recorder));
        }
        assert_eq!(transport.sent_count(), 7);
        assert_eq!(recorder.completions.len(), 1);
        assert_eq!(recorder.completions[0].status, Err(Error::Timeout));
        assert!(recorder.completions[0].response.is_none());
    }

    #[test]
    fn test_cancel_and_destroy_report_nothing() {
        let (mut session, transport, timers) = setup();
        let mut recorder = Recorder::default();
        let first = session
            .send(session.create_request(method::BINDING, 1), &SendOptions::new(server()))
            .unwrap();
        session
            .send(session.create_request(method::BINDING, 2), &SendOptions::new(server()))
            .unwrap();

        assert_eq!(session.cancel(&first), Some(1));
        assert_eq!(session.cancel(&first), None);
        session.destroy();
        assert_eq!(session.pending_count(), 0);
        assert_eq!(timers.pending(), 0);

        for (bytes, _) in transport.sent() {
            let request = StunMessage::parse(&bytes).unwrap();
            session
                .on_rx_packet(&success_for(&request, None), server(), &mut recorder)
                .unwrap();
        }
        assert!(recorder.completions.is_empty());
    }

    #[test]
    fn test_long_term_challenge_updates_nonce() {
        let (mut session, transport, _timers) = setup();
        let mut recorder = Recorder::default();
        session.set_credential(
            AuthKind::LongTerm,
            Some(Credential::Static(StaticCredential::new("user", "pass"))),
        );

        session
            .send(session.create_request(method::ALLOCATE, 1), &SendOptions::new(server()))
            .unwrap();
        let (first, _) = transport.last_message().unwrap();
        assert!(!first.has_attribute(ATTR_MESSAGE_INTEGRITY));
        assert!(!first.has_attribute(ATTR_USERNAME));

        let challenge = StunMessage::response_to(&first, MessageClass::ErrorResponse)
            .with(Attribute::ErrorCode {
                code: 401,
                reason: "Unauthorized".into(),
            })
            .with(Attribute::Realm("example.org".into()))
            .with(Attribute::Nonce("abc123".into()))
            .encode(&EncodeOptions::default())
            .unwrap();
        session.on_rx_packet(&challenge, server(), &mut recorder).unwrap();

        assert_eq!(recorder.completions.len(), 1);
        assert_eq!(recorder.completions[0].status.as_ref().unwrap_err().status_code(), Some(401));
        assert_eq!(session.realm(), Some("example.org"));
        assert_eq!(session.nonce(), Some("abc123"));

        session
            .send(session.create_request(method::ALLOCATE, 2), &SendOptions::new(server()))
            .unwrap();
        let (bytes, _) = transport.sent().pop().unwrap();
        let second = StunMessage::parse(&bytes).unwrap();
        assert_eq!(second.find_attribute(ATTR_USERNAME), Some(&Attribute::Username("user".into())));
        assert_eq!(second.realm(), Some("example.org"));
        assert_eq!(second.find_attribute(ATTR_NONCE), Some(&Attribute::Nonce("abc123".into())));
        assert!(second.has_attribute(ATTR_REALM));
        let key = auth::long_term_key("user", "example.org", b"pass");
        assert_eq!(auth::verify_message_integrity(&key, &bytes), Ok(true));
    }

    struct TokenCredential {
        realms: Rc<RefCell<Vec<Option<String>>>>,
        available: Rc<Cell<bool>>,
    }

    impl DynamicCredential for TokenCredential {
        fn credential(&self, realm: Option<&str>) -> Option<CredentialInfo> {
            self.realms.borrow_mut().push(realm.map(str::to_string));
            self.available.get().then(|| CredentialInfo {
                username: "dyn".into(),
                password: b"token".to_vec(),
                password_kind: PasswordKind::Plain,
            })
        }
    }

    #[test]
    fn test_dynamic_credential_follows_challenge() {
        let (mut session, transport, _timers) = setup();
        let mut recorder = Recorder::default();
        let realms = Rc::new(RefCell::new(Vec::new()));
        let available = Rc::new(Cell::new(true));
        session.set_credential(
            AuthKind::LongTerm,
            Some(Credential::Dynamic(Box::new(TokenCredential {
                realms: realms.clone(),
                available: available.clone(),
            }))),
        );
        assert_eq!(session.realm(), None);

        session
            .send(session.create_request(method::ALLOCATE, 1), &SendOptions::new(server()))
            .unwrap();
        let (first, _) = transport.last_message().unwrap();
        assert!(!first.has_attribute(ATTR_USERNAME));
        assert!(realms.borrow().is_empty());

        let challenge = StunMessage::response_to(&first, MessageClass::ErrorResponse)
            .with(Attribute::ErrorCode {
                code: 401,
                reason: "Unauthorized".into(),
            })
            .with(Attribute::Realm("example.org".into()))
            .with(Attribute::Nonce("n1".into()))
            .encode(&EncodeOptions::default())
            .unwrap();
        session.on_rx_packet(&challenge, server(), &mut recorder).unwrap();
        assert_eq!(session.realm(), Some("example.org"));
        assert_eq!(session.nonce(), Some("n1"));

        session
            .send(session.create_request(method::ALLOCATE, 2), &SendOptions::new(server()))
            .unwrap();
        assert_eq!(*realms.borrow(), vec![Some("example.org".to_string())]);
        let (bytes, _) = transport.sent().pop().unwrap();
        let second = StunMessage::parse(&bytes).unwrap();
        assert_eq!(second.find_attribute(ATTR_USERNAME), Some(&Attribute::Username("dyn".into())));
        assert_eq!(second.nonce(), Some("n1"));
        let key = auth::long_term_key("dyn", "example.org", b"token");
        assert_eq!(auth::verify_message_integrity(&key, &bytes), Ok(true));

        // no credential for the realm: the request still goes out, unsigned
        available.set(false);
        session
            .send(session.create_request(method::ALLOCATE, 3), &SendOptions::new(server()))
            .unwrap();
        let (third, _) = transport.last_message().unwrap();
        assert!(!third.has_attribute(ATTR_USERNAME));
        assert!(!third.has_attribute(ATTR_MESSAGE_INTEGRITY));
        assert_eq!(realms.borrow().len(), 2);
    }

    #[test]
    fn test_bad_integrity_response_is_ignored() {
        let (mut session, transport, timers) = setup();
        let mut recorder = Recorder::default();
        session.set_credential(
            AuthKind::ShortTerm,
            Some(Credential::Static(StaticCredential::new("user", "secret"))),
        );
        session
            .send(session.create_request(method::BINDING, 9), &SendOptions::new(server()))
            .unwrap();
        let (request, _) = transport.last_message().unwrap();
        assert!(request.has_attribute(ATTR_MESSAGE_INTEGRITY));

        let forged = success_for(&request, Some(b"wrong"));
        assert!(matches!(
            session.on_rx_packet(&forged, server(), &mut recorder),
            Err(Error::Auth(_))
        ));
        assert!(recorder.completions.is_empty());
        assert_eq!(session.pending_count(), 1);
        assert_eq!(timers.pending(), 1);

        let genuine = success_for(&request, Some(b"secret"));
        session.on_rx_packet(&genuine, server(), &mut recorder).unwrap();
        assert_eq!(recorder.completions.len(), 1);
        assert_eq!(recorder.completions[0].status, Ok(()));
    }

    #[test]
    fn test_corrupted_fingerprint_leaves_transaction_untouched() {
        let (mut session, transport, timers) = setup();
        let mut recorder = Recorder::default();
        session
            .send(session.create_request(method::BINDING, 3), &SendOptions::new(server()))
            .unwrap();
        let (request, _) = transport.last_message().unwrap();

        let mut response = success_for(&request, None);
        let last = response.len() - 1;
        response[last] ^= 0xff;
        assert!(session.on_rx_packet(&response, server(), &mut recorder).is_err());
        assert!(recorder.completions.is_empty());
        assert!(session.is_pending(&request.transaction_id));

        // retransmission goes on as if nothing arrived
        let handle = timers.fire_next().unwrap();
        assert!(session.on_timer(handle, &mut recorder));
        assert_eq!(transport.sent_count(), 2);
    }

    #[test]
    fn test_inbound_requests_and_indications_dispatch() {
        let (mut session, transport, _timers) = setup();
        let mut recorder = Recorder::default();
        let indication = StunMessage::new(method::DATA, MessageClass::Indication, [1; 12])
            .with(Attribute::Data(b"hi".to_vec()))
            .encode(&EncodeOptions::default())
            .unwrap();
        let request = StunMessage::new(method::BINDING, MessageClass::Request, [2; 12])
            .encode(&EncodeOptions::default())
            .unwrap();
        session.on_rx_packet(&indication, server(), &mut recorder).unwrap();
        session.on_rx_packet(&request, server(), &mut recorder).unwrap();
        assert_eq!(recorder.indications.len(), 1);
        assert_eq!(recorder.requests.len(), 1);

        let response = session.create_response(&recorder.requests[0], MessageClass::SuccessResponse);
        let options = SendOptions {
            authenticate: false,
            ..SendOptions::new(server())
        };
        session.send(response, &options).unwrap();
        let (sent, _) = transport.last_message().unwrap();
        assert_eq!(sent.class, MessageClass::SuccessResponse);
        assert_eq!(sent.transaction_id, [2; 12]);
        assert_eq!(session.pending_count(), 0);
    }

    #[test]
    fn test_unknown_timer_is_not_claimed() {
        let (mut session, _transport, _timers) = setup();
        let mut recorder = Recorder::default();
        assert!(!session.on_timer(TimerHandle(999), &mut recorder));
    }
}
