//! Interface descriptor lookup in a raw configuration descriptor

pub const DESCRIPTOR_TYPE_CONFIGURATION: u8 = 0x02;
pub const DESCRIPTOR_TYPE_INTERFACE: u8 = 0x04;

const INTERFACE_DESCRIPTOR_LENGTH: usize = 9;

/// Standard USB interface descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterfaceDescriptor {
    pub interface_number: u8,
    pub alternate_setting: u8,
    pub num_endpoints: u8,
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
    pub string_index: u8,
}

/// Byte offset of the interface descriptor for `interface`/`alternate_setting`
///
/// Walks the descriptor chain by `bLength`. A descriptor shorter than its
/// two-byte header or running past the end of the buffer ends the walk.
pub fn find_interface_offset(config: &[u8], interface: u8, alternate_setting: u8) -> Option<usize> {
    let mut offset = 0;

    while offset + 2 <= config.len() {
        let length = config[offset] as usize;
        if length < 2 || offset + length > config.len() {
            return None;
        }

        if config[offset + 1] == DESCRIPTOR_TYPE_INTERFACE
            && length >= INTERFACE_DESCRIPTOR_LENGTH
            && config[offset + 2] == interface
            && config[offset + 3] == alternate_setting
        {
            return Some(offset);
        }

        offset += length;
    }

    None
}

/// Locate and decode an interface descriptor
pub fn find_interface_descriptor(
    config: &[u8],
    interface: u8,
    alternate_setting: u8,
) -> Option<InterfaceDescriptor> {
    let offset = find_interface_offset(config, interface, alternate_setting)?;
    let raw = &config[offset..offset + INTERFACE_DESCRIPTOR_LENGTH];

    Some(InterfaceDescriptor {
        interface_number: raw[2],
        alternate_setting: raw[3],
        num_endpoints: raw[4],
        class: raw[5],
        subclass: raw[6],
        protocol: raw[7],
        string_index: raw[8],
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::test_utils::create_mock_config_descriptor;

    #[test]
    fn test_finds_alternate_setting() {
        let config = create_mock_config_descriptor();

        let alt0 = find_interface_descriptor(&config, 0, 0).unwrap();
        assert_eq!(alt0.num_endpoints, 1);

        let alt1 = find_interface_descriptor(&config, 0, 1).unwrap();
        assert_eq!(alt1.alternate_setting, 1);
        assert_eq!(alt1.num_endpoints, 2);
        assert_eq!(find_interface_offset(&config, 0, 1), Some(25));

        let hid = find_interface_descriptor(&config, 1, 0).unwrap();
        assert_eq!(hid.class, 0x03);
    }

    #[test]
    fn test_missing_interface() {
        let config = create_mock_config_descriptor();
        assert!(find_interface_descriptor(&config, 2, 0).is_none());
        assert!(find_interface_descriptor(&config, 1, 1).is_none());
    }

    #[test]
    fn test_zero_length_descriptor_stops_walk() {
        let mut config = create_mock_config_descriptor();
        config[9] = 0;
        assert!(find_interface_descriptor(&config, 0, 0).is_none());
    }

    #[test]
    fn test_truncated_buffer() {
        let config = create_mock_config_descriptor();
        assert!(find_interface_descriptor(&config[..14], 0, 0).is_none());
        assert!(find_interface_descriptor(&[], 0, 0).is_none());
        assert!(find_interface_descriptor(&[9], 0, 0).is_none());
    }
}
