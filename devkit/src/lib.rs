/*!
# Relay DevKit - stubs and helpers for engine tests

- Mock MQTT client recording publishes and subscriptions
- Mock HTTP device decoding length-prefixed frames
- Test harness with expectations on topics and frames
*/

pub mod device_stub;
pub mod frame;
pub mod mqtt_stub;
pub mod test_utils;

pub use device_stub::MockDevice;
pub use frame::{decode_frame, encode_frame};
pub use mqtt_stub::MockMqttClient;
pub use test_utils::TestHarness;
