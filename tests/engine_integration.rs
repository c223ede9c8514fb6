//! End-to-end exercise of the protocol engine against an in-process fake
//! broker built directly on `zmq::ROUTER`/`zmq::PUB` sockets — the
//! happy-path and bind-reject scenarios from spec.md §8, with no real
//! mDNS daemon or external broker process required.

use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use prost::Message as _;

use hal_remote::pin::{PinDirection, PinType, PinValue};
use hal_remote::proto::{Comp, Container, ContainerType, PParams, WireHalType, WirePin};
use hal_remote::RemoteComponent;

fn bound_endpoint(socket: &zmq::Socket) -> String {
    socket
        .get_last_endpoint()
        .expect("get_last_endpoint failed")
        .expect("endpoint is not valid UTF-8")
}

/// A minimal broker: answers `PING` with `PING_ACKNOWLEDGE`, `HALRCOMP_BIND`
/// with `HALRCOMP_BIND_CONFIRM` followed by a full update assigning
/// handles 1/2, and forwards any received `HALRCOMP_SET` to the test
/// thread for assertion.
fn spawn_fake_broker(ctx: zmq::Context, component: &'static str) -> (String, String, mpsc::Receiver<WirePin>) {
    let router = ctx.socket(zmq::ROUTER).unwrap();
    router.bind("tcp://127.0.0.1:*").unwrap();
    let cmd_uri = bound_endpoint(&router);

    let publisher = ctx.socket(zmq::PUB).unwrap();
    publisher.bind("tcp://127.0.0.1:*").unwrap();
    let comp_uri = bound_endpoint(&publisher);

    let (set_tx, set_rx) = mpsc::channel();

    thread::spawn(move || {
        let mut bound = false;
        loop {
            let mut items = [router.as_poll_item(zmq::POLLIN)];
            if zmq::poll(&mut items, 500).unwrap_or(0) == 0 {
                continue;
            }
            let Ok(frames) = router.recv_multipart(0) else { continue };
            let Some(identity) = frames.first() else { continue };
            let Some(body) = frames.get(1) else { continue };
            let Ok(container) = Container::decode(body.as_slice()) else { continue };

            match container.container_type() {
                ContainerType::Ping => {
                    let reply = Container::of_type(ContainerType::PingAcknowledge);
                    let _ = router.send_multipart([identity.clone(), reply.encode_to_vec()], 0);
                }
                ContainerType::HalrcompBind => {
                    let reply = Container::of_type(ContainerType::HalrcompBindConfirm);
                    let _ = router.send_multipart([identity.clone(), reply.encode_to_vec()], 0);

                    if !bound {
                        bound = true;
                        let mut comp = Comp {
                            name: component.to_string(),
                            no_create: false,
                            pin: Vec::new(),
                        };
                        let mut button0 = WirePin::new(1, WireHalType::Bit as i32);
                        button0.name = Some(format!("{component}.button0"));
                        button0.halbit = Some(false);
                        comp.pin.push(button0);
                        let mut led = WirePin::new(2, WireHalType::Bit as i32);
                        led.name = Some(format!("{component}.led"));
                        led.halbit = Some(false);
                        comp.pin.push(led);

                        let mut full_update = Container::of_type(ContainerType::HalrcompFullUpdate);
                        full_update.comp.push(comp);
                        full_update.pparams = Some(PParams { keepalive_timer: Some(2000) });

                        let _ = publisher.send_multipart(
                            [component.as_bytes().to_vec(), full_update.encode_to_vec()],
                            0,
                        );
                    }
                }
                ContainerType::HalrcompSet => {
                    for wire in container.pin {
                        let _ = set_tx.send(wire);
                    }
                }
                _ => {}
            }
        }
    });

    (cmd_uri, comp_uri, set_rx)
}

#[test_log::test]
fn happy_path_reaches_connected_and_propagates_a_set() {
    let ctx = zmq::Context::new();
    let (cmd_uri, comp_uri, set_rx) = spawn_fake_broker(ctx, "anddemo");

    let comp = RemoteComponent::new("anddemo").unwrap();
    let button0 = comp.newpin("button0", PinType::Bit, PinDirection::Out).unwrap();
    comp.newpin("led", PinType::Bit, PinDirection::In).unwrap();

    comp.set_halrcmd_uri(cmd_uri);
    comp.set_halrcomp_uri(comp_uri);
    comp.ready().unwrap();

    assert!(comp.wait_connected(Some(Duration::from_secs(5))), "never reached Connected");

    button0.set(PinValue::Bit(true));

    let wire = set_rx.recv_timeout(Duration::from_secs(5)).expect("no HALRCOMP_SET observed");
    assert_eq!(wire.handle, 1);
    assert_eq!(wire.halbit, Some(true));

    comp.stop();
}

#[test]
fn wait_connected_with_no_broker_times_out() {
    let comp = RemoteComponent::new("anddemo-unreachable").unwrap();
    comp.newpin("button0", PinType::Bit, PinDirection::Out).unwrap();
    comp.set_halrcmd_uri("tcp://127.0.0.1:1");
    comp.set_halrcomp_uri("tcp://127.0.0.1:2");
    comp.ready().unwrap();

    assert!(!comp.wait_connected(Some(Duration::from_millis(200))));
    comp.stop();
}
