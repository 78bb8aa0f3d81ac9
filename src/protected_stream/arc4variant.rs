use std::num::Wrapping;

/// RC4 as modified by KeePass: key scheduling swaps against slot 0 and the
/// first 512 bytes of keystream are dropped
pub struct ArcFourVariant {
    i: Wrapping<u8>,
    j: Wrapping<u8>,
    state: [Wrapping<u8>; 256],
}

impl ArcFourVariant {
    pub fn new(key: &[u8]) -> Self {
        let mut rc4 = Self {
            i: Wrapping(0),
            j: Wrapping(0),
            state: [Wrapping(0); 256],
        };

        for i in 0..256 {
            rc4.state[i] = Wrapping(i as u8);
        }

        let mut j = Wrapping(0u8);
        for i in 0..256 {
            j += rc4.state[i] + Wrapping(key[i % key.len()]);
            rc4.state.swap(0, j.0 as usize);
        }

        rc4.gen(&mut [0; 512]);
        rc4
    }

    pub fn gen(&mut self, buf: &mut [u8]) {
        for byte in buf.iter_mut() {
            self.i += Wrapping(1);
            self.j += self.state[self.i.0 as usize];
            self.state.swap(self.i.0 as usize, self.j.0 as usize);
            let t = self.state[self.i.0 as usize] + self.state[self.j.0 as usize];
            *byte ^= self.state[t.0 as usize].0;
        }
    }
}
