use portico_crypto::hex::encode_hex;

/// Short hex form of an identifier for log fields.
pub fn abbrev_id(id: &[u8]) -> String {
    let hex = encode_hex(id);
    if hex.len() > 16 {
        hex[..16].to_string()
    } else {
        hex
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn abbreviates_long_ids() {
        assert_eq!(abbrev_id(&[0xab; 32]), "abababababababab");
        assert_eq!(abbrev_id(&[0x01, 0x02]), "0102");
    }
}
