//! Engine tests against the scripted in-memory hoster

use super::test_helpers::*;
use super::*;
use crate::model::{FileState, file};
use crate::store::{Channel, ChannelListener, DiffAction};
use serde_json::json;

mod http;

const URL: &str = "http://host.example/data.bin";
