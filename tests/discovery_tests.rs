use pulsebus::discovery::*;
use serialport::{SerialPortInfo, SerialPortType, UsbPortInfo};

fn usb_port(name: &str, manufacturer: Option<&str>, serial: Option<&str>) -> SerialPortInfo {
    SerialPortInfo {
        port_name: name.to_string(),
        port_type: SerialPortType::UsbPort(UsbPortInfo {
            vid: 0x2341,
            pid: 0x0043,
            serial_number: serial.map(str::to_string),
            manufacturer: manufacturer.map(str::to_string),
            product: None,
        }),
    }
}

fn attached_ports() -> Vec<SerialPortInfo> {
    vec![
        usb_port("/dev/ttyACM0", Some("Arduino (www.arduino.cc)"), Some("A1")),
        usb_port("/dev/ttyUSB0", Some("FTDI"), Some("F1")),
        usb_port("/dev/ttyACM1", None, Some("A2")),
        SerialPortInfo {
            port_name: "/dev/ttyS0".to_string(),
            port_type: SerialPortType::Unknown,
        },
        SerialPortInfo {
            port_name: "/dev/rfcomm0".to_string(),
            port_type: SerialPortType::BluetoothPort,
        },
    ]
}

#[test]
fn test_vendor_substring_match() {
    let found = SerialPortDiscovery::default().filter(&attached_ports());

    assert_eq!(found.ports, vec!["/dev/ttyACM0".to_string()]);
    assert_eq!(found.serial_numbers, vec!["A1".to_string()]);
    assert_eq!(found.first(), Some(("/dev/ttyACM0", "A1")));
}

#[test]
fn test_allow_list_overrides_vendor() {
    let discovery = SerialPortDiscovery::default().with_allowed_serials(vec!["F1".to_string(), "A2".to_string()]);
    let found = discovery.filter(&attached_ports());

    // The Arduino-branded board is not on the list, the unbranded one is
    assert_eq!(found.ports, vec!["/dev/ttyUSB0".to_string(), "/dev/ttyACM1".to_string()]);
    assert_eq!(found.serial_numbers, vec!["F1".to_string(), "A2".to_string()]);
}

#[test]
fn test_non_usb_ports_skipped() {
    let ports = vec![
        SerialPortInfo {
            port_name: "/dev/ttyS0".to_string(),
            port_type: SerialPortType::Unknown,
        },
        SerialPortInfo {
            port_name: "/dev/rfcomm0".to_string(),
            port_type: SerialPortType::BluetoothPort,
        },
    ];

    let found = SerialPortDiscovery::new("").filter(&ports);
    assert!(found.is_empty());
    assert_eq!(found.first(), None);
}
