//! IO modules - external system interfaces
//!
//! - `frame_channel` - RS-485 gate register reads (CRC16 framed)
//! - `reader` - TCP client for the RFID reader (loop start/stop, tag reports)
//! - `tag_decoder` - Tag report frame decoding
//! - `egress_channel` - Report payloads and the non-blocking hand-off
//! - `mqtt_egress` - MQTT publisher and connection loop
//! - `mqtt` - Inbound backend messages
//! - `prometheus` - Prometheus metrics HTTP endpoint

pub mod egress_channel;
pub mod frame_channel;
pub mod mqtt;
pub mod mqtt_egress;
pub mod prometheus;
pub mod reader;
pub mod tag_decoder;

pub use egress_channel::{create_report_channel, OutboundReport, ReportSender, ReportSink, TagReport};
pub use frame_channel::{open_serial, FrameChannel, SerialLink};
pub use mqtt_egress::MqttPublisher;
pub use reader::{create_reader, ReaderClient, ReaderClientConfig, ReaderCommand, ReaderControl, ReaderHandle};
pub use tag_decoder::{CnntTagDecoder, TagDecoder};
