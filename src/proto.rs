//! Minimal stand-in for the external `Container`/`Pin`/`pparams` protobuf
//! schema (spec.md §6). The wire format itself is explicitly out of scope
//! for this crate; what follows is the smallest set of fields the engine
//! needs to drive the state machine, written by hand in the shape a
//! generated `prost` module would take rather than derived from a `.proto`
//! file (none is provided — see spec.md §1).

use prost::Message;

/// `MT_*` discriminants from the original schema. Kept as a plain `i32`
/// enum rather than a richer Rust enum because the wire field is an
/// unconstrained protobuf enum: unknown values must round-trip rather than
/// fail to decode (a future broker version may send a type this crate
/// doesn't recognize yet).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(i32)]
pub enum ContainerType {
    Ping = 0,
    PingAcknowledge = 1,
    HalrcompBind = 2,
    HalrcompBindConfirm = 3,
    HalrcompBindReject = 4,
    HalrcompSet = 5,
    HalrcompSetReject = 6,
    HalrcompFullUpdate = 7,
    HalrcompIncrementalUpdate = 8,
    HalrcommandError = 9,
    Unknown(i32),
}

impl ContainerType {
    pub fn from_i32(v: i32) -> Self {
        match v {
            0 => Self::Ping,
            1 => Self::PingAcknowledge,
            2 => Self::HalrcompBind,
            3 => Self::HalrcompBindConfirm,
            4 => Self::HalrcompBindReject,
            5 => Self::HalrcompSet,
            6 => Self::HalrcompSetReject,
            7 => Self::HalrcompFullUpdate,
            8 => Self::HalrcompIncrementalUpdate,
            9 => Self::HalrcommandError,
            other => Self::Unknown(other),
        }
    }

    pub fn to_i32(self) -> i32 {
        match self {
            Self::Ping => 0,
            Self::PingAcknowledge => 1,
            Self::HalrcompBind => 2,
            Self::HalrcompBindConfirm => 3,
            Self::HalrcompBindReject => 4,
            Self::HalrcompSet => 5,
            Self::HalrcompSetReject => 6,
            Self::HalrcompFullUpdate => 7,
            Self::HalrcompIncrementalUpdate => 8,
            Self::HalrcommandError => 9,
            Self::Unknown(other) => other,
        }
    }
}

/// `HALTYPE_*`: the pin value type discriminant carried on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(i32)]
pub enum WireHalType {
    Bit = 0,
    Float = 1,
    S32 = 2,
    U32 = 3,
}

/// `HALDIR_*`: the pin direction discriminant carried on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(i32)]
pub enum WireHalDirection {
    In = 0,
    Out = 1,
    Io = 2,
}

/// One pin entry, as carried in a `comp.pin` (bind/full-update) or a
/// top-level `pin` (incremental update / set) repeated field.
///
/// Exactly one of `halbit`/`halfloat`/`hals32`/`halu32` is set at a time;
/// `prost`'s `oneof` support would normally express this, but the set of
/// fields is small and fixed enough that plain `Option`s plus a decode-time
/// check of [`WirePin::payload_field_count`] (see `engine::decode_payload`)
/// keep this module legible without hand-rolling a `oneof` wrapper type.
#[derive(Clone, Debug, PartialEq, Message)]
pub struct WirePin {
    /// Full-update only: `"<component>.<pin>"`.
    #[prost(string, optional, tag = "1")]
    pub name: Option<String>,

    #[prost(uint32, tag = "2")]
    pub handle: u32,

    #[prost(int32, tag = "3")]
    pub r#type: i32,

    /// Bind only.
    #[prost(int32, optional, tag = "4")]
    pub dir: Option<i32>,

    #[prost(bool, optional, tag = "5")]
    pub halbit: Option<bool>,

    #[prost(float, optional, tag = "6")]
    pub halfloat: Option<f32>,

    #[prost(int32, optional, tag = "7")]
    pub hals32: Option<i32>,

    #[prost(uint32, optional, tag = "8")]
    pub halu32: Option<u32>,
}

impl WirePin {
    pub fn new(handle: u32, r#type: i32) -> Self {
        Self {
            name: None,
            handle,
            r#type,
            dir: None,
            halbit: None,
            halfloat: None,
            hals32: None,
            halu32: None,
        }
    }

    /// Number of payload fields set. Should be exactly 1 on any message
    /// this crate sends or accepts as well-formed.
    pub fn payload_field_count(&self) -> usize {
        [
            self.halbit.is_some(),
            self.halfloat.is_some(),
            self.hals32.is_some(),
            self.halu32.is_some(),
        ]
        .into_iter()
        .filter(|set| *set)
        .count()
    }
}

/// One component descriptor, as carried in `Container.comp` (bind only).
#[derive(Clone, Debug, PartialEq, Message)]
pub struct Comp {
    #[prost(string, tag = "1")]
    pub name: String,

    #[prost(bool, tag = "2")]
    pub no_create: bool,

    #[prost(message, repeated, tag = "3")]
    pub pin: Vec<WirePin>,
}

/// Broker-advertised subscription parameters, carried on full updates.
#[derive(Clone, Debug, PartialEq, Message)]
pub struct PParams {
    #[prost(uint32, optional, tag = "1")]
    pub keepalive_timer: Option<u32>,
}

/// Top-level envelope for every command-channel and subscription-channel
/// message.
#[derive(Clone, Debug, PartialEq, Message)]
pub struct Container {
    #[prost(int32, tag = "1")]
    pub r#type: i32,

    #[prost(string, optional, tag = "2")]
    pub note: Option<String>,

    #[prost(message, optional, tag = "3")]
    pub pparams: Option<PParams>,

    #[prost(message, repeated, tag = "4")]
    pub comp: Vec<Comp>,

    #[prost(message, repeated, tag = "5")]
    pub pin: Vec<WirePin>,
}

impl Container {
    pub fn of_type(t: ContainerType) -> Self {
        Self {
            r#type: t.to_i32(),
            note: None,
            pparams: None,
            comp: Vec::new(),
            pin: Vec::new(),
        }
    }

    pub fn container_type(&self) -> ContainerType {
        ContainerType::from_i32(self.r#type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn container_type_round_trips_through_i32() {
        for t in [
            ContainerType::Ping,
            ContainerType::HalrcompBindConfirm,
            ContainerType::HalrcompIncrementalUpdate,
        ] {
            assert_eq!(ContainerType::from_i32(t.to_i32()), t);
        }
        assert_eq!(ContainerType::from_i32(999), ContainerType::Unknown(999));
    }

    #[test]
    fn wire_pin_encode_decode_round_trip() {
        let mut p = WirePin::new(7, WireHalType::Bit as i32);
        p.halbit = Some(true);
        assert_eq!(p.payload_field_count(), 1);

        let bytes = p.encode_to_vec();
        let decoded = WirePin::decode(bytes.as_slice()).unwrap();
        assert_eq!(decoded, p);
    }

    #[test]
    fn container_with_nested_comp_round_trips() {
        let mut comp = Comp {
            name: "anddemo".to_string(),
            no_create: false,
            pin: Vec::new(),
        };
        let mut p = WirePin::new(0, WireHalType::Bit as i32);
        p.name = Some("anddemo.button0".to_string());
        p.dir = Some(WireHalDirection::Out as i32);
        p.halbit = Some(false);
        comp.pin.push(p);

        let mut c = Container::of_type(ContainerType::HalrcompBind);
        c.comp.push(comp);

        let bytes = c.encode_to_vec();
        let decoded = Container::decode(bytes.as_slice()).unwrap();
        assert_eq!(decoded.container_type(), ContainerType::HalrcompBind);
        assert_eq!(decoded.comp[0].pin[0].name.as_deref(), Some("anddemo.button0"));
    }
}
