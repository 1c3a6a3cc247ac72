use crate::*;

/// Immutable geometry shared by every allocator component.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressInfo {
    num_segments: u32,
    stripes_per_segment: u32,
    blks_per_stripe: u32,
    num_wb_stripes: u32,
    num_streams: u32,
    tails_per_stream: u32,
}

impl AddressInfo {
    pub(crate) fn from_config(config: &Config) -> Result<AddressInfo> {
        let info = AddressInfo {
            num_segments: config.num_segments,
            stripes_per_segment: config.stripes_per_segment,
            blks_per_stripe: config.blks_per_stripe,
            num_wb_stripes: config.num_wb_stripes,
            num_streams: config.num_streams,
            tails_per_stream: config.tails_per_stream,
        };
        info.validate()?;
        Ok(info)
    }

    fn validate(&self) -> Result<()> {
        macro_rules! supported {
            ($cond:expr, $msg:expr) => {
                if !$cond {
                    return Err(Error::Unsupported($msg.to_owned()));
                }
            };
        }

        supported!(self.num_segments > 0, "num_segments must be non-zero");
        supported!(
            self.stripes_per_segment > 0,
            "stripes_per_segment must be non-zero"
        );
        supported!(self.blks_per_stripe > 0, "blks_per_stripe must be non-zero");
        supported!(self.num_wb_stripes > 0, "num_wb_stripes must be non-zero");
        supported!(self.num_streams > 0, "num_streams must be non-zero");
        supported!(
            (1..=2).contains(&self.tails_per_stream),
            "tails_per_stream must be 1 (user) or 2 (user + gc)"
        );
        supported!(
            u64::from(self.num_segments) * u64::from(self.stripes_per_segment)
                < u64::from(UNMAP_STRIPE),
            "too many user-area stripes to address"
        );
        supported!(
            u64::from(self.stripes_per_segment)
                * u64::from(self.blks_per_stripe)
                <= u64::from(u32::MAX),
            "segment capacity in blocks must fit in a u32 counter"
        );
        Ok(())
    }

    pub fn num_segments(&self) -> u32 {
        self.num_segments
    }

    pub fn stripes_per_segment(&self) -> u32 {
        self.stripes_per_segment
    }

    pub fn blks_per_stripe(&self) -> u32 {
        self.blks_per_stripe
    }

    pub fn num_wb_stripes(&self) -> u32 {
        self.num_wb_stripes
    }

    pub fn num_streams(&self) -> u32 {
        self.num_streams
    }

    pub fn tails_per_stream(&self) -> u32 {
        self.tails_per_stream
    }

    pub fn blks_per_segment(&self) -> u32 {
        self.stripes_per_segment * self.blks_per_stripe
    }

    pub fn num_user_stripes(&self) -> u32 {
        self.num_segments * self.stripes_per_segment
    }

    pub fn tail_array_len(&self) -> usize {
        self.num_streams as usize * self.tails_per_stream as usize
    }

    pub fn segment_of(&self, vsid: StripeId) -> SegmentId {
        vsid / self.stripes_per_segment
    }

    pub fn first_stripe_of(&self, segment: SegmentId) -> StripeId {
        segment * self.stripes_per_segment
    }

    pub fn is_last_stripe_of_segment(&self, vsid: StripeId) -> bool {
        (vsid + 1) % self.stripes_per_segment == 0
    }

    pub(crate) fn tail_idx(&self, stream: StreamId, slot: TailSlot) -> Result<TailIdx> {
        if stream >= self.num_streams {
            return Err(Error::Unsupported(format!(
                "stream {} is out of range (num_streams = {})",
                stream, self.num_streams
            )));
        }
        if slot as u32 >= self.tails_per_stream {
            return Err(Error::Unsupported(format!(
                "tail slot {:?} is not configured",
                slot
            )));
        }
        Ok(TailIdx::new(stream, slot, self.num_streams))
    }

    /// Every tail index belonging to `stream`, user slot first.
    pub(crate) fn tails_of_stream(
        &self,
        stream: StreamId,
    ) -> impl Iterator<Item = TailIdx> + '_ {
        (0..self.tails_per_stream).map(move |slot| {
            TailIdx(stream as usize + slot as usize * self.num_streams as usize)
        })
    }
}

#[test]
fn rejects_zero_geometry() {
    let config = Config::new().num_segments(0);
    assert!(matches!(
        AddressInfo::from_config(&config),
        Err(Error::Unsupported(_))
    ));
}

#[test]
fn derived_counts() {
    let config = Config::new()
        .num_segments(4)
        .stripes_per_segment(2)
        .blks_per_stripe(4)
        .num_streams(3);
    let info = AddressInfo::from_config(&config).unwrap();
    assert_eq!(info.blks_per_segment(), 8);
    assert_eq!(info.num_user_stripes(), 8);
    assert_eq!(info.segment_of(5), 2);
    assert!(info.is_last_stripe_of_segment(5));
    assert_eq!(info.tail_array_len(), 6);
    let tails: Vec<TailIdx> = info.tails_of_stream(1).collect();
    assert_eq!(tails, vec![TailIdx(1), TailIdx(4)]);
}
