//! AVSS session core: control point engine, report reassembly and firmware
//! transfer, independent of how frames physically reach the node.
//!
//! A session is generic over an [`AvssChannel`] that delivers control point
//! requests and program writes. Incoming report segments and program NACKs
//! are fed by the binding through [`AvssSession::handle_report_segment`] and
//! [`AvssSession::handle_program_notify`].

use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use bytes::{BufMut, Bytes, BytesMut};
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

use crate::cbor::{self, Value};
use crate::error::{AvssError, ControlPointError};
use crate::marshal::{Marshal, Unmarshal};

use super::models::{
    ApplySettingsArgs, ApplySettingsResponse, ApplyUpgradeArgs, ConfirmUpgradeArgs,
    ControlPointResponse, DeactivateArgs, GetFirmwareInfoResponse, GetVersionResponse,
    HealthCount, ParsedReport, PrepareUpgradeArgs, Report, ReportAggregatesArgs,
    ReportCaptureArgs, ReportHealthArgs, ReportSettingsArgs, ReportSnippetArgs,
    ReportTransferInfo, TestThroughputArgs, TriggerMeasurementArgs, WriteSettingsResponse,
    WriteSettingsV2Args, WriteSettingsV2Response,
};
use super::opcode::OpCode;

const SEGMENT_FIRST: u8 = 0x80;
const SEGMENT_LAST: u8 = 0x40;
const SEGMENT_NUMBER_MASK: u8 = 0x3F;

/// Offset sentinel by which the node aborts a firmware transfer.
const PROGRAM_ABORT: u32 = 0xFFFF_FFFF;

/// Default ATT MTU assumed for program writes.
pub const DEFAULT_ATT_MTU: usize = 243;

const CONTROL_POINT_TIMEOUT: Duration = Duration::from_secs(2);
const PREPARE_UPGRADE_TIMEOUT: Duration = Duration::from_secs(30);

// Protocol tuning constants for the program-channel backpressure loop. The
// node NACKs with the offset it wants rewritten; a quiet window means the
// writes are in sync, and after a NACK we wait for the burst to settle
// before rewinding.
const PROGRAM_NACK_IDLE: Duration = Duration::from_millis(40);
const PROGRAM_NACK_COALESCE: Duration = Duration::from_millis(100);

const REPORT_QUEUE_CAPACITY: usize = 128;

/// Physical delivery of AVSS frames, implemented by the direct-BLE and
/// transceiver-proxy bindings.
#[allow(async_fn_in_trait)]
pub trait AvssChannel: Send + Sync {
    /// Write a control point request and return the node's response frame.
    async fn request_raw(&self, frame: Bytes) -> Result<Bytes, AvssError>;

    /// Write a program frame without response.
    async fn program_write(&self, frame: Bytes) -> Result<(), AvssError>;

    /// Tear down the underlying connection.
    async fn close(&self);
}

struct ReportAssembly {
    start_time: f64,
    started: Instant,
    buffer: BytesMut,
    num_segments: u32,
    next_segment: u8,
}

impl ReportAssembly {
    fn new(first_segment: u8) -> Self {
        ReportAssembly {
            start_time: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs_f64(),
            started: Instant::now(),
            buffer: BytesMut::new(),
            num_segments: 0,
            next_segment: first_segment,
        }
    }

    fn append(&mut self, payload: &[u8]) {
        self.buffer.extend_from_slice(payload);
        self.num_segments += 1;
        self.next_segment = (self.next_segment + 1) & SEGMENT_NUMBER_MASK;
    }

    fn finish(self) -> Option<Report> {
        let transfer_info = ReportTransferInfo {
            start_time: self.start_time,
            elapsed_time: self.started.elapsed().as_secs_f64(),
            num_bytes: self.buffer.len(),
            num_segments: self.num_segments,
        };
        Report::from_record(self.buffer.freeze(), Some(transfer_info))
    }
}

/// Shared per-session protocol state. Bindings feed incoming notifications
/// into it; the client half drives requests and transfers through it.
pub struct AvssSession {
    assembly: StdMutex<Option<ReportAssembly>>,
    report_tx: broadcast::Sender<Report>,
    nack_tx: StdMutex<Option<mpsc::UnboundedSender<u32>>>,
    control_point: Mutex<()>,
    program: Mutex<()>,
    disconnected: watch::Sender<bool>,
}

impl AvssSession {
    fn new() -> Self {
        AvssSession {
            assembly: StdMutex::new(None),
            report_tx: broadcast::channel(REPORT_QUEUE_CAPACITY).0,
            nack_tx: StdMutex::new(None),
            control_point: Mutex::new(()),
            program: Mutex::new(()),
            disconnected: watch::channel(false).0,
        }
    }

    /// Feed one Report characteristic notification into the reassembler.
    pub fn handle_report_segment(&self, segment: &[u8]) {
        let Some((&header, payload)) = segment.split_first() else {
            warn!("Empty report segment dropped");
            return;
        };
        let segment_number = header & SEGMENT_NUMBER_MASK;

        debug!("Report segment received");

        let mut assembly = self.assembly.lock().unwrap();

        if header & SEGMENT_FIRST != 0 {
            if assembly.is_some() {
                warn!("Report aborted");
            }
            *assembly = Some(ReportAssembly::new(segment_number));
        }

        let Some(current) = assembly.as_mut() else {
            // Waiting for a first segment to synchronize with the stream.
            return;
        };

        if current.next_segment == segment_number {
            current.append(payload);
        } else {
            warn!(
                "Expected segment {} but got {}",
                current.next_segment, segment_number
            );
            *assembly = None;
            return;
        }

        if header & SEGMENT_LAST != 0 {
            match assembly.take().and_then(ReportAssembly::finish) {
                Some(report) => {
                    // Fan out to every live subscriber; nobody listening is fine.
                    let _ = self.report_tx.send(report);
                }
                None => warn!("Empty report record dropped"),
            }
        }
    }

    /// Feed one Program characteristic notification (a little-endian NACK
    /// offset) into the active transfer, if any.
    pub fn handle_program_notify(&self, value: &[u8]) {
        let Ok(offset_bytes) = <[u8; 4]>::try_from(value) else {
            warn!("Malformed program notification of {} bytes", value.len());
            return;
        };
        let offset = u32::from_le_bytes(offset_bytes);
        if let Some(tx) = self.nack_tx.lock().unwrap().as_ref() {
            let _ = tx.send(offset);
        }
    }

    /// Resolve the session's disconnection future. All pending awaits fail
    /// with [`AvssError::Disconnected`]; idempotent.
    pub fn set_disconnected(&self) {
        self.disconnected.send_replace(true);
    }

    pub fn is_disconnected(&self) -> bool {
        *self.disconnected.borrow()
    }

    fn disconnected_rx(&self) -> watch::Receiver<bool> {
        self.disconnected.subscribe()
    }
}

/// A stream of raw [`Report`]s from one session.
///
/// Dropping the stream unsubscribes it. If reports arrive faster than the
/// consumer drains them, the oldest queued reports are dropped.
pub struct ReportStream {
    rx: broadcast::Receiver<Report>,
    disconnected: watch::Receiver<bool>,
}

impl ReportStream {
    pub async fn recv(&mut self) -> Result<Report, AvssError> {
        loop {
            tokio::select! {
                // Drain queued reports before giving up on disconnect.
                biased;
                received = self.rx.recv() => match received {
                    Ok(report) => return Ok(report),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Report queue overflow, {n} reports dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(AvssError::Disconnected);
                    }
                },
                _ = wait_disconnected(&mut self.disconnected) => {
                    return Err(AvssError::Disconnected);
                }
            }
        }
    }
}

/// A stream of typed reports; unknown or malformed payloads are skipped.
pub struct ParsedReportStream {
    inner: ReportStream,
}

impl ParsedReportStream {
    pub async fn recv(&mut self) -> Result<ParsedReport, AvssError> {
        loop {
            let report = self.inner.recv().await?;
            match report.parse() {
                Ok(Some(parsed)) => return Ok(parsed),
                Ok(None) => warn!("Unknown report type skipped in report stream"),
                Err(e) => warn!("Undecodable report payload skipped: {e}"),
            }
        }
    }
}

async fn wait_disconnected(rx: &mut watch::Receiver<bool>) {
    // An error means the session is gone, which counts as disconnected.
    let _ = rx.wait_for(|disconnected| *disconnected).await;
}

/// An AVSS client session over some channel binding.
pub struct AvssClient<C: AvssChannel> {
    channel: C,
    session: Arc<AvssSession>,
}

impl<C: AvssChannel> AvssClient<C> {
    /// Wrap a channel in a fresh session. Bindings feed notifications into
    /// [`AvssClient::session`].
    pub fn new(channel: C) -> Self {
        AvssClient {
            channel,
            session: Arc::new(AvssSession::new()),
        }
    }

    pub fn session(&self) -> Arc<AvssSession> {
        self.session.clone()
    }

    pub fn channel(&self) -> &C {
        &self.channel
    }

    /// A future that resolves when the session disconnects.
    pub async fn closed(&self) {
        wait_disconnected(&mut self.session.disconnected_rx()).await;
    }

    pub fn is_disconnected(&self) -> bool {
        self.session.is_disconnected()
    }

    /// Tear down the binding and fail all pending awaits.
    pub async fn disconnect(&self) {
        self.channel.close().await;
        self.session.set_disconnected();
    }

    /// Subscribe to raw reports, including transfer statistics.
    pub fn reports(&self) -> ReportStream {
        ReportStream {
            rx: self.session.report_tx.subscribe(),
            disconnected: self.session.disconnected_rx(),
        }
    }

    /// Subscribe to typed reports.
    pub fn parsed_reports(&self) -> ParsedReportStream {
        ParsedReportStream { inner: self.reports() }
    }

    /// Issue a control point request with the default timeout. Returns the
    /// typed response, or `None` for a plain OK status reply.
    pub async fn request(
        &self,
        opcode: OpCode,
        argument: Option<Value>,
    ) -> Result<Option<ControlPointResponse>, AvssError> {
        self.request_with_timeout(opcode, argument, CONTROL_POINT_TIMEOUT)
            .await
    }

    pub async fn request_with_timeout(
        &self,
        opcode: OpCode,
        argument: Option<Value>,
        request_timeout: Duration,
    ) -> Result<Option<ControlPointResponse>, AvssError> {
        // Requests are strictly one at a time per session.
        let _guard = self.session.control_point.lock().await;

        let argument = argument.unwrap_or(Value::Null);
        let encoded = cbor::to_vec(&argument)?;
        let mut frame = BytesMut::with_capacity(1 + encoded.len());
        frame.put_u8(opcode.into());
        frame.extend_from_slice(&encoded);

        debug!("Sending Control Point request");
        let response = match timeout(request_timeout, self.channel.request_raw(frame.freeze())).await
        {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                error!("Control Point request aborted");
                return Err(e);
            }
            Err(_) => return Err(AvssError::ControlPointTimeout),
        };
        debug!("Control Point request completed");

        parse_control_point_response(opcode, &response)
    }

    pub async fn report_snippets(
        &self,
        count: Option<i64>,
        auto_resume: bool,
    ) -> Result<(), AvssError> {
        let arg = ReportSnippetArgs { count, auto_resume };
        self.request(OpCode::ReportSnippet, Some(arg.marshal())).await?;
        Ok(())
    }

    pub async fn report_capture(
        &self,
        count: Option<i64>,
        auto_resume: bool,
    ) -> Result<(), AvssError> {
        let arg = ReportCaptureArgs { count, auto_resume };
        self.request(OpCode::ReportCapture, Some(arg.marshal())).await?;
        Ok(())
    }

    pub async fn report_aggregates(
        &self,
        count: Option<i64>,
        auto_resume: bool,
    ) -> Result<(), AvssError> {
        let arg = ReportAggregatesArgs { count, auto_resume };
        self.request(OpCode::ReportAggregates, Some(arg.marshal())).await?;
        Ok(())
    }

    /// Request health reports. Without a count, `true` is sent instead,
    /// which older node firmware understands as the activation flag.
    pub async fn report_health(&self, count: Option<i64>) -> Result<(), AvssError> {
        let count = match count {
            Some(count) => HealthCount::Count(count),
            None => HealthCount::Active(true),
        };
        let arg = ReportHealthArgs { count };
        self.request(OpCode::ReportHealth, Some(arg.marshal())).await?;
        Ok(())
    }

    pub async fn report_settings(&self, current: bool, pending: bool) -> Result<(), AvssError> {
        let arg = ReportSettingsArgs { current, pending };
        self.request(OpCode::ReportSettings, Some(arg.marshal())).await?;
        Ok(())
    }

    pub async fn apply_settings(&self, persist: bool) -> Result<ApplySettingsResponse, AvssError> {
        let arg = ApplySettingsArgs { persist };
        match self.request(OpCode::ApplySettings, Some(arg.marshal())).await? {
            Some(ControlPointResponse::ApplySettings(resp)) => Ok(resp),
            other => Err(unexpected_response(other)),
        }
    }

    /// Write an integer-keyed settings map (see
    /// [`super::settings::SettingsMapper`] for the readable-name mapping).
    pub async fn write_settings(&self, settings: Value) -> Result<WriteSettingsResponse, AvssError> {
        match self.request(OpCode::WriteSettings, Some(settings)).await? {
            Some(ControlPointResponse::WriteSettings(resp)) => Ok(resp),
            other => Err(unexpected_response(other)),
        }
    }

    pub async fn write_settings_v2(
        &self,
        settings: Value,
        reset_defaults: bool,
        apply: bool,
    ) -> Result<WriteSettingsV2Response, AvssError> {
        let arg = WriteSettingsV2Args {
            settings,
            reset_defaults,
            apply,
        };
        match self.request(OpCode::WriteSettingsV2, Some(arg.marshal())).await? {
            Some(ControlPointResponse::WriteSettingsV2(resp)) => Ok(resp),
            other => Err(unexpected_response(other)),
        }
    }

    pub async fn reset_settings(&self) -> Result<(), AvssError> {
        self.request(OpCode::ResetSettings, None).await?;
        Ok(())
    }

    pub async fn reset_report(&self) -> Result<(), AvssError> {
        self.request(OpCode::ResetReport, None).await?;
        Ok(())
    }

    pub async fn get_version(&self) -> Result<GetVersionResponse, AvssError> {
        match self.request(OpCode::GetVersion, None).await? {
            Some(ControlPointResponse::GetVersion(resp)) => Ok(resp),
            other => Err(unexpected_response(other)),
        }
    }

    pub async fn get_firmware_info(&self) -> Result<GetFirmwareInfoResponse, AvssError> {
        match self.request(OpCode::GetFirmwareInfo, None).await? {
            Some(ControlPointResponse::GetFirmwareInfo(resp)) => Ok(resp),
            other => Err(unexpected_response(other)),
        }
    }

    pub async fn test_throughput(&self, duration_ms: i64) -> Result<(), AvssError> {
        let arg = TestThroughputArgs { duration: duration_ms };
        self.request(OpCode::TestThroughput, Some(arg.marshal())).await?;
        Ok(())
    }

    pub async fn deactivate(&self, key: u32) -> Result<(), AvssError> {
        let arg = DeactivateArgs { key };
        self.request(OpCode::Deactivate, Some(arg.marshal())).await?;
        Ok(())
    }

    pub async fn trigger_measurement(&self, duration_ms: i64) -> Result<(), AvssError> {
        let arg = TriggerMeasurementArgs { duration_ms };
        self.request(OpCode::TriggerMeasurement, Some(arg.marshal())).await?;
        Ok(())
    }

    pub async fn prepare_upgrade(&self, image: i64, size: i64) -> Result<(), AvssError> {
        let arg = PrepareUpgradeArgs { image, size };
        self.request_with_timeout(
            OpCode::PrepareUpgrade,
            Some(arg.marshal()),
            PREPARE_UPGRADE_TIMEOUT,
        )
        .await?;
        Ok(())
    }

    pub async fn apply_upgrade(&self) -> Result<(), AvssError> {
        let arg = ApplyUpgradeArgs {};
        self.request(OpCode::ApplyUpgrade, Some(arg.marshal())).await?;
        Ok(())
    }

    pub async fn confirm_upgrade(&self, image: i64) -> Result<(), AvssError> {
        let arg = ConfirmUpgradeArgs { image };
        self.request(OpCode::ConfirmUpgrade, Some(arg.marshal())).await?;
        Ok(())
    }

    pub async fn reboot(&self) -> Result<(), AvssError> {
        self.request(OpCode::Reboot, None).await?;
        Ok(())
    }

    /// Stream a firmware image over the program channel with the default
    /// ATT MTU.
    pub async fn program_transfer(&self, image: &[u8]) -> Result<(), AvssError> {
        self.program_transfer_mtu(image, DEFAULT_ATT_MTU).await
    }

    /// Stream a firmware image over the program channel.
    ///
    /// The node NACKs with the offset it wants rewritten whenever its write
    /// pointer falls behind; 0xFFFFFFFF aborts the transfer.
    pub async fn program_transfer_mtu(
        &self,
        image: &[u8],
        att_mtu: usize,
    ) -> Result<(), AvssError> {
        // Write-without-response carries ATT MTU - 3 bytes, of which 4 are
        // the offset prefix.
        let chunk_size = att_mtu - 3 - 4;

        let _guard = self.session.program.lock().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        *self.session.nack_tx.lock().unwrap() = Some(tx);

        let result = self.program_write_loop(image, chunk_size, &mut rx).await;

        *self.session.nack_tx.lock().unwrap() = None;
        result
    }

    async fn program_write_loop(
        &self,
        image: &[u8],
        chunk_size: usize,
        nacks: &mut mpsc::UnboundedReceiver<u32>,
    ) -> Result<(), AvssError> {
        let mut offset = 0usize;

        while offset < image.len() {
            loop {
                // Wait a short while for a NACK indicating the node is not
                // in sync with our writes.
                match timeout(PROGRAM_NACK_IDLE, nacks.recv()).await {
                    Ok(Some(PROGRAM_ABORT)) => return Err(AvssError::TransferAborted),
                    Ok(Some(nack_offset)) => {
                        offset = nack_offset as usize;
                        // Let any further queued NACKs turn up before
                        // resuming, so a burst collapses into one rewind.
                        sleep(PROGRAM_NACK_COALESCE).await;
                    }
                    Ok(None) => return Err(AvssError::Disconnected),
                    // No NACK turned up, the writes are on track.
                    Err(_) => break,
                }
            }

            let end = usize::min(offset + chunk_size, image.len());
            let mut frame = BytesMut::with_capacity(4 + (end - offset));
            frame.put_u32_le(offset as u32);
            frame.extend_from_slice(&image[offset..end]);
            self.channel.program_write(frame.freeze()).await?;
            offset = end;

            info!(
                "Program {}/{} ({:.0} %)",
                offset,
                image.len(),
                offset as f64 * 100.0 / image.len() as f64
            );
        }

        Ok(())
    }
}

fn unexpected_response(response: Option<ControlPointResponse>) -> AvssError {
    AvssError::Protocol(format!("unexpected control point response: {response:?}"))
}

fn parse_control_point_response(
    opcode: OpCode,
    response: &[u8],
) -> Result<Option<ControlPointResponse>, AvssError> {
    let Some((&response_opcode, body)) = response.split_first() else {
        return Err(AvssError::Protocol("empty control point response".into()));
    };

    if response_opcode == u8::from(OpCode::ResponseCode) {
        if body.len() < 2 {
            return Err(AvssError::Protocol("short status response".into()));
        }
        let (request_opcode, response_code) = (body[0], body[1]);
        if request_opcode != u8::from(opcode) {
            warn!(
                "Request opcode mismatch received: {} expected: {}",
                request_opcode,
                u8::from(opcode)
            );
        }
        return match ControlPointError::from_response_code(response_code) {
            None => Ok(None),
            Some(err) => Err(AvssError::ControlPoint(err)),
        };
    }

    let value = cbor::from_slice(body)?;
    let parsed = match OpCode::try_from(response_opcode) {
        Ok(OpCode::GetVersionResponse) => {
            ControlPointResponse::GetVersion(GetVersionResponse::unmarshal(&value)?)
        }
        Ok(OpCode::WriteSettingsResponse) => {
            ControlPointResponse::WriteSettings(WriteSettingsResponse::unmarshal(&value)?)
        }
        Ok(OpCode::WriteSettingsV2Response) => {
            ControlPointResponse::WriteSettingsV2(WriteSettingsV2Response::unmarshal(&value)?)
        }
        Ok(OpCode::ApplySettingsResponse) => {
            ControlPointResponse::ApplySettings(ApplySettingsResponse::unmarshal(&value)?)
        }
        Ok(OpCode::GetFirmwareInfoResponse) => {
            ControlPointResponse::GetFirmwareInfo(GetFirmwareInfoResponse::unmarshal(&value)?)
        }
        _ => {
            return Err(AvssError::Protocol(format!(
                "unexpected response opcode {response_opcode}"
            )));
        }
    };
    Ok(Some(parsed))
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    struct MockChannel {
        responses: StdMutex<VecDeque<Bytes>>,
        requests: mpsc::UnboundedSender<Bytes>,
        program_writes: mpsc::UnboundedSender<Bytes>,
        in_flight: AtomicUsize,
    }

    fn mock_client(
        responses: &[&str],
    ) -> (
        Arc<AvssClient<MockChannel>>,
        mpsc::UnboundedReceiver<Bytes>,
        mpsc::UnboundedReceiver<Bytes>,
    ) {
        let (req_tx, req_rx) = mpsc::unbounded_channel();
        let (prog_tx, prog_rx) = mpsc::unbounded_channel();
        let channel = MockChannel {
            responses: StdMutex::new(
                responses
                    .iter()
                    .map(|r| Bytes::from(hex::decode(r).unwrap()))
                    .collect(),
            ),
            requests: req_tx,
            program_writes: prog_tx,
            in_flight: AtomicUsize::new(0),
        };
        (Arc::new(AvssClient::new(channel)), req_rx, prog_rx)
    }

    impl AvssChannel for MockChannel {
        async fn request_raw(&self, frame: Bytes) -> Result<Bytes, AvssError> {
            assert_eq!(
                self.in_flight.fetch_add(1, Ordering::SeqCst),
                0,
                "interleaved control point requests"
            );
            self.requests.send(frame).unwrap();
            sleep(Duration::from_millis(5)).await;
            let response = self
                .responses
                .lock()
                .unwrap()
                .pop_front()
                .expect("no scripted response left");
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(response)
        }

        async fn program_write(&self, frame: Bytes) -> Result<(), AvssError> {
            self.program_writes.send(frame).unwrap();
            Ok(())
        }

        async fn close(&self) {}
    }

    #[tokio::test]
    async fn test_report_assembly() {
        let (client, _req, _prog) = mock_client(&[]);
        let mut reports = client.reports();
        let session = client.session();

        session.handle_report_segment(&hex::decode("8005a100182a").unwrap());
        session.handle_report_segment(&hex::decode("01182b").unwrap());
        session.handle_report_segment(&hex::decode("42182c").unwrap());

        let report = reports.recv().await.unwrap();
        assert_eq!(report.report_type, 0x05);
        assert_eq!(
            report.payload_cbor.as_ref(),
            hex::decode("a100182a182b182c").unwrap()
        );
        let info = report.transfer_info.unwrap();
        assert_eq!(info.num_segments, 3);
        assert_eq!(info.num_bytes, 9);
    }

    #[tokio::test]
    async fn test_resync_on_mid_record_first() {
        let (client, _req, _prog) = mock_client(&[]);
        let mut reports = client.reports();
        let session = client.session();

        // Partial record, then a fresh FIRST|LAST record.
        session.handle_report_segment(&[0x80, 0x05, 0xAA]);
        session.handle_report_segment(&[0xC0, 0x04, 0xF6]);

        let report = reports.recv().await.unwrap();
        assert_eq!(report.report_type, 0x04);
        assert_eq!(report.payload_cbor.as_ref(), &[0xF6]);
        assert_eq!(report.transfer_info.unwrap().num_segments, 1);
    }

    #[tokio::test]
    async fn test_resync_on_gap() {
        let (client, _req, _prog) = mock_client(&[]);
        let mut reports = client.reports();
        let session = client.session();

        session.handle_report_segment(&[0x80, 0x05, 0xAA]);
        // Segment 2 after segment 0: record discarded.
        session.handle_report_segment(&[0x42, 0xBB]);
        // Non-FIRST segments are ignored until resynchronized.
        session.handle_report_segment(&[0x43, 0xCC]);
        // A fresh record assembles normally.
        session.handle_report_segment(&[0xC0, 0x04, 0xF6]);

        let report = reports.recv().await.unwrap();
        assert_eq!(report.report_type, 0x04);
    }

    #[tokio::test]
    async fn test_segment_numbers_wrap_mod_64() {
        let (client, _req, _prog) = mock_client(&[]);
        let mut reports = client.reports();
        let session = client.session();

        session.handle_report_segment(&[0x80 | 0x3F, 0x04]);
        session.handle_report_segment(&[0x40, 0xF6]);

        let report = reports.recv().await.unwrap();
        assert_eq!(report.report_type, 0x04);
        assert_eq!(report.payload_cbor.as_ref(), &[0xF6]);
    }

    #[tokio::test]
    async fn test_get_version() {
        let (client, mut requests, _prog) =
            mock_client(&["06a2006676312e322e33016162"]);

        let version = client.get_version().await.unwrap();
        assert_eq!(version.version, "v1.2.3");
        assert_eq!(version.build_version, "b");

        // Request frame is the opcode followed by CBOR nil.
        let frame = requests.recv().await.unwrap();
        assert_eq!(frame.as_ref(), hex::decode("05f6").unwrap());
    }

    #[tokio::test]
    async fn test_control_point_error() {
        let (client, _req, _prog) = mock_client(&["010503"]);

        match client.get_version().await {
            Err(AvssError::ControlPoint(ControlPointError::OpCodeUnsupported)) => {}
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unknown_response_opcode() {
        let (client, _req, _prog) = mock_client(&["63a0"]);

        assert!(matches!(
            client.get_version().await,
            Err(AvssError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn test_control_point_requests_serialized() {
        // The mock panics if two requests overlap.
        let (client, _req, _prog) = mock_client(&["010101", "010101"]);

        let (a, b) = tokio::join!(client.reboot(), client.reboot());
        // Reboot echoes opcode 103 normally; the mock echoes opcode 1,
        // which only logs a mismatch warning.
        a.unwrap();
        b.unwrap();
    }

    #[tokio::test]
    async fn test_report_stream_ends_on_disconnect() {
        let (client, _req, _prog) = mock_client(&[]);
        let mut reports = client.reports();

        client.session().set_disconnected();
        assert!(matches!(reports.recv().await, Err(AvssError::Disconnected)));
    }

    #[tokio::test]
    async fn test_program_transfer_backpressure_and_abort() {
        let (client, _req, mut prog) = mock_client(&[]);
        let session = client.session();
        let image = vec![0xA5u8; 10000];

        let transfer = {
            let client = client.clone();
            tokio::spawn(async move { client.program_transfer(&image).await })
        };

        // First chunk: offset 0, 236 payload bytes (ATT MTU 243).
        let first = prog.recv().await.unwrap();
        assert_eq!(&first[..4], &0u32.to_le_bytes());
        assert_eq!(first.len(), 4 + 236);

        let second = prog.recv().await.unwrap();
        assert_eq!(&second[..4], &236u32.to_le_bytes());
        let _third = prog.recv().await.unwrap();

        // NACK back to offset 0x80: a later write must resume there.
        session.handle_program_notify(&0x80u32.to_le_bytes());
        let mut resumed = false;
        for _ in 0..8 {
            let frame = prog.recv().await.unwrap();
            if frame[..4] == 0x80u32.to_le_bytes() {
                resumed = true;
                break;
            }
        }
        assert!(resumed, "transfer did not rewind to the NACKed offset");

        // The abort sentinel terminates the transfer.
        session.handle_program_notify(&0xFFFF_FFFFu32.to_le_bytes());
        match transfer.await.unwrap() {
            Err(AvssError::TransferAborted) => {}
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
