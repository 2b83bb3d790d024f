use std::fmt::Display;

/// Running min / max / mean of integer samples.
#[derive(Clone, Debug, PartialEq)]
pub struct Stats {
    pub count: usize,
    pub min: usize,
    pub max: usize,
    pub avg: f32,
}

impl Stats {
    pub fn new_single(v: usize) -> Self {
        Stats {
            count: 1,
            min: v,
            max: v,
            avg: v as f32,
        }
    }

    pub fn add_sample(&mut self, value: usize) {
        self.count += 1;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
        self.avg += (value as f32 - self.avg) / (self.count as f32);
    }

    pub fn add_samples(&mut self, values: impl IntoIterator<Item = usize>) {
        for value in values {
            self.add_sample(value);
        }
    }

    pub fn merge(&self, other: &Self) -> Self {
        let count = self.count + other.count;
        Stats {
            count,
            min: self.min.min(other.min),
            max: self.max.max(other.max),
            avg: if count > 0 {
                (self.avg * self.count as f32 + other.avg * other.count as f32) / count as f32
            } else {
                0.0
            },
        }
    }

    /// Shifts every sample by `offset`, keeping the count.
    pub fn offset(&self, offset: usize) -> Self {
        if self.count == 0 {
            return self.clone();
        }
        Stats {
            count: self.count,
            min: self.min + offset,
            max: self.max + offset,
            avg: self.avg + offset as f32,
        }
    }
}

impl Default for Stats {
    fn default() -> Self {
        Stats {
            count: 0,
            min: usize::MAX,
            max: 0,
            avg: 0.0,
        }
    }
}

impl FromIterator<usize> for Stats {
    fn from_iter<T: IntoIterator<Item = usize>>(iter: T) -> Self {
        let mut stats = Stats::default();
        stats.add_samples(iter);
        stats
    }
}

impl Display for Stats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.count == 0 {
            return write!(f, "no samples");
        }
        write!(
            f,
            "{} - {}; avg {:.1}; {} samples",
            self.min, self.max, self.avg, self.count
        )
    }
}
