//! Basic usage example for the tether wire protocol.

use std::time::SystemTime;

use tether_wire::{
    build_close, build_echo, build_initial, build_stream, derive_key, envelope_len, time_bucket,
    EnvelopeCipher, Header, NonceCounter, StreamHeader, ENVELOPE_PREFIX_SIZE, STREAM_HEADER_SIZE,
};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("=== Tether Wire Protocol Example ===\n");

    // 1. Build a batch of frames
    println!("1. Building frames...");
    let mut batch = Vec::new();
    batch.extend_from_slice(&build_initial(0, 1, b"")?);
    batch.extend_from_slice(&build_stream(0, 0, b"Hello, remote host!")?);
    batch.extend_from_slice(&build_echo(&[1, 2, 3, 4, 5, 6]));
    batch.extend_from_slice(&build_close(0)?);
    println!("   Plaintext batch: {} bytes", batch.len());

    // 2. Seal the batch
    println!("\n2. Sealing with a time-bucketed key...");
    let key = derive_key(b"shared secret", time_bucket(SystemTime::now()))?;
    let cipher = EnvelopeCipher::new(&key);
    let mut send_nonce = NonceCounter::generate();
    let mut recv_nonce = send_nonce;

    let envelope = cipher.seal(&mut send_nonce, &batch)?;
    println!("   Envelope size: {} bytes", envelope.len());

    // 3. Open it again
    println!("\n3. Opening the envelope...");
    let len = envelope_len([envelope[0], envelope[1]])?;
    let plaintext = cipher.open(
        &mut recv_nonce,
        &envelope[ENVELOPE_PREFIX_SIZE..ENVELOPE_PREFIX_SIZE + len],
    )?;

    // 4. Walk the second frame
    let offset = 1 + STREAM_HEADER_SIZE;
    let header = Header::decode(plaintext[offset]);
    let sub = StreamHeader::unpack([plaintext[offset + 1], plaintext[offset + 2]]);
    let start = offset + 1 + STREAM_HEADER_SIZE;
    let body = &plaintext[start..start + sub.length as usize];
    println!(
        "   {:?} frame on stream {}: {:?}",
        header.typ(),
        header.data(),
        std::str::from_utf8(body)?
    );

    Ok(())
}
