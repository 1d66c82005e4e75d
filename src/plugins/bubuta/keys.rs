//! Key exchange carried by food group 0

/// Candidate keys selected by the index in a type 0 message
const KEY_TABLE: [Option<&[u8]>; 5] = [
    Some(&[0x98, 0x82, 0x51, 0xb0, 0x59]),
    None,
    None,
    None,
    Some(&[0x0f, 0xd6, 0x76, 0x90, 0x1c]),
];

const KEY_INDEX_OFFSET: usize = 6;
const KEY_MATERIAL_OFFSET: usize = 20;
const INSTALLED_KEY_OFFSET: usize = 11;

/// Message types that change the connection key
pub const TYPE_DERIVE: u8 = 0;
pub const TYPE_INSTALL: u8 = 1;

/// Key a food group 0 message switches to, if any.
///
/// Type 0 XORs a payload segment with the table key picked by its index;
/// type 1 carries the new key verbatim after a fixed prefix. Payloads too
/// short for either layout leave the key alone.
pub fn negotiated_key(kind: u8, payload: &[u8]) -> Option<Vec<u8>> {
    match kind {
        TYPE_DERIVE => {
            let index = *payload.get(KEY_INDEX_OFFSET)? as usize;
            let table_key = KEY_TABLE.get(index).copied().flatten()?;
            let material = payload.get(KEY_MATERIAL_OFFSET..KEY_MATERIAL_OFFSET + table_key.len())?;
            Some(material.iter().zip(table_key).map(|(a, b)| a ^ b).collect())
        }
        TYPE_INSTALL => payload.get(INSTALLED_KEY_OFFSET..).map(<[u8]>::to_vec),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_with_table_key() {
        let mut payload = vec![0u8; 25];
        payload[KEY_INDEX_OFFSET] = 4;
        payload[20..25].copy_from_slice(&[0x0f ^ 1, 0xd6 ^ 2, 0x76 ^ 3, 0x90 ^ 4, 0x1c ^ 5]);

        assert_eq!(negotiated_key(TYPE_DERIVE, &payload), Some(vec![1, 2, 3, 4, 5]));
    }

    #[test]
    fn test_derive_with_empty_table_slot() {
        let mut payload = vec![0u8; 25];
        payload[KEY_INDEX_OFFSET] = 2;
        assert_eq!(negotiated_key(TYPE_DERIVE, &payload), None);

        payload[KEY_INDEX_OFFSET] = 9;
        assert_eq!(negotiated_key(TYPE_DERIVE, &payload), None);
    }

    #[test]
    fn test_derive_needs_full_material() {
        let mut payload = vec![0u8; 22];
        payload[KEY_INDEX_OFFSET] = 0;
        assert_eq!(negotiated_key(TYPE_DERIVE, &payload), None);
    }

    #[test]
    fn test_install_takes_tail() {
        let mut payload = vec![0u8; 11];
        payload.extend_from_slice(b"secret");
        assert_eq!(negotiated_key(TYPE_INSTALL, &payload), Some(b"secret".to_vec()));
        assert_eq!(negotiated_key(TYPE_INSTALL, &[0u8; 4]), None);
        assert_eq!(negotiated_key(7, &payload), None);
    }
}
