use crate::error::{Error, Result};
use crate::markers::trajectory::{find_unique_suffix, MarkerTrajectory};

/// 下半身モデルで使うマーカー識別子（40点）
///
/// 配置は Maldonado et al. 2018 の下肢マーカーセットに準拠。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(usize)]
pub enum MarkerId {
    C7 = 0,
    C2 = 1,
    T6 = 2,
    T10 = 3,
    S1 = 4,
    S3 = 5,
    Clav = 6,
    Strn = 7,

    Lpsi = 8,
    Rpsi = 9,
    Lasi = 10,
    Rasi = 11,

    Lthi = 12,
    Lthib = 13,
    Lthid = 14,
    Lknee = 15,
    Lkneem = 16,
    Ltib = 17,
    Ltibf = 18,
    Ltibd = 19,
    Lank = 20,
    Lankm = 21,
    Lhee = 22,
    Lnav = 23,
    Ltoe = 24,
    Ltoe5 = 25,

    Rthi = 26,
    Rthib = 27,
    Rthid = 28,
    Rknee = 29,
    Rkneem = 30,
    Rtib = 31,
    Rtibf = 32,
    Rtibd = 33,
    Rank = 34,
    Rankm = 35,
    Rhee = 36,
    Rnav = 37,
    Rtoe = 38,
    Rtoe5 = 39,
}

impl MarkerId {
    pub const COUNT: usize = 40;

    pub const ALL: [MarkerId; Self::COUNT] = {
        use MarkerId::*;
        [
            C7, C2, T6, T10, S1, S3, Clav, Strn, Lpsi, Rpsi, Lasi, Rasi, Lthi, Lthib, Lthid, Lknee,
            Lkneem, Ltib, Ltibf, Ltibd, Lank, Lankm, Lhee, Lnav, Ltoe, Ltoe5, Rthi, Rthib, Rthid,
            Rknee, Rkneem, Rtib, Rtibf, Rtibd, Rank, Rankm, Rhee, Rnav, Rtoe, Rtoe5,
        ]
    };

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    /// キャプチャ上の正規ラベル
    pub fn label(self) -> &'static str {
        use MarkerId::*;
        match self {
            C7 => "C7",
            C2 => "C2",
            T6 => "T6",
            T10 => "T10",
            S1 => "S1",
            S3 => "S3",
            Clav => "CLAV",
            Strn => "STRN",
            Lpsi => "LPSI",
            Rpsi => "RPSI",
            Lasi => "LASI",
            Rasi => "RASI",
            Lthi => "LTHI",
            Lthib => "LTHIB",
            Lthid => "LTHID",
            Lknee => "LKNE",
            Lkneem => "LKNEM",
            Ltib => "LTIB",
            Ltibf => "LTIBF",
            Ltibd => "LTIBD",
            Lank => "LANK",
            Lankm => "LANKM",
            Lhee => "LHEE",
            Lnav => "LNAV",
            Ltoe => "LTOE",
            Ltoe5 => "LTOE5",
            Rthi => "RTHI",
            Rthib => "RTHIB",
            Rthid => "RTHID",
            Rknee => "RKNE",
            Rkneem => "RKNEM",
            Rtib => "RTIB",
            Rtibf => "RTIBF",
            Rtibd => "RTIBD",
            Rank => "RANK",
            Rankm => "RANKM",
            Rhee => "RHEE",
            Rnav => "RNAV",
            Rtoe => "RTOE",
            Rtoe5 => "RTOE5",
        }
    }
}

/// 識別子 → キャプチャ上のマーカー番号の対応表
///
/// 接尾辞照合はここで一度だけ行い、以降は [`MarkerNames::relabel`] で
/// 正規ラベルに付け替えた試行を使う。
#[derive(Debug, Clone, PartialEq)]
pub struct MarkerNames {
    indices: Vec<Option<usize>>,
}

impl MarkerNames {
    /// 全マーカーが揃っていることを要求する（静的試行用）
    pub fn resolve<S: AsRef<str>>(captured: &[S]) -> Result<Self> {
        let indices = MarkerId::ALL
            .iter()
            .map(|id| find_unique_suffix(captured, id.label()).map(Some))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { indices })
    }

    /// 見つかったマーカーだけを対応付ける（機能的試行用）
    ///
    /// 曖昧なラベルはエラーにする。
    pub fn resolve_available<S: AsRef<str>>(captured: &[S]) -> Result<Self> {
        let indices = MarkerId::ALL
            .iter()
            .map(|id| match find_unique_suffix(captured, id.label()) {
                Ok(index) => Ok(Some(index)),
                Err(Error::MarkerNotFound(_)) => Ok(None),
                Err(e) => Err(e),
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { indices })
    }

    pub fn index(&self, id: MarkerId) -> Option<usize> {
        self.indices[id as usize]
    }

    pub fn len(&self) -> usize {
        self.indices.iter().flatten().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 対応の取れたマーカーだけを正規ラベルで持つ試行を作る
    ///
    /// マーカーの並びは [`MarkerId::ALL`] の順。対応のないラベルは落とす。
    pub fn relabel(&self, trial: &MarkerTrajectory) -> Result<MarkerTrajectory> {
        let (names, indices): (Vec<String>, Vec<usize>) = MarkerId::ALL
            .iter()
            .filter_map(|&id| self.index(id).map(|i| (id.label().to_string(), i)))
            .unzip();
        trial.select_markers(&indices, names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[test]
    fn test_marker_id_count() {
        assert_eq!(MarkerId::ALL.len(), MarkerId::COUNT);
        for (i, id) in MarkerId::ALL.iter().enumerate() {
            assert_eq!(*id as usize, i);
        }
    }

    #[test]
    fn test_from_index() {
        assert_eq!(MarkerId::from_index(0), Some(MarkerId::C7));
        assert_eq!(MarkerId::from_index(39), Some(MarkerId::Rtoe5));
        assert_eq!(MarkerId::from_index(40), None);
    }

    #[test]
    fn test_labels_unambiguous() {
        // どの正規ラベルも他のラベルの接尾辞になっていない
        for a in MarkerId::ALL {
            for b in MarkerId::ALL {
                if a != b {
                    assert!(!b.label().ends_with(a.label()), "{} / {}", a.label(), b.label());
                }
            }
        }
    }

    #[test]
    fn test_resolve_with_prefix() {
        let captured: Vec<String> = MarkerId::ALL.iter().rev().map(|id| format!("Sub01:{}", id.label())).collect();
        let names = MarkerNames::resolve(&captured).unwrap();
        assert_eq!(names.index(MarkerId::Rtoe5), Some(0));
        assert_eq!(names.index(MarkerId::C7), Some(MarkerId::COUNT - 1));
        assert_eq!(names.len(), MarkerId::COUNT);
    }

    #[test]
    fn test_resolve_missing() {
        let captured: Vec<String> = MarkerId::ALL[1..].iter().map(|id| id.label().to_string()).collect();
        let result = MarkerNames::resolve(&captured);
        assert_eq!(result.unwrap_err(), Error::MarkerNotFound("C7".to_string()));
    }

    #[test]
    fn test_resolve_available_skips_missing() {
        let captured = ["Sub01:LASI", "Sub01:RASI", "Sub01:LTHI", "Sub01:FOO"];
        let names = MarkerNames::resolve_available(&captured).unwrap();
        assert_eq!(names.len(), 3);
        assert_eq!(names.index(MarkerId::Lthi), Some(2));
        assert_eq!(names.index(MarkerId::C7), None);

        let ambiguous = ["Sub01:LASI", "Sub02:LASI"];
        assert!(matches!(MarkerNames::resolve_available(&ambiguous), Err(Error::AmbiguousMarker { .. })));
    }

    #[test]
    fn test_relabel_to_canonical() {
        let data = ndarray::Array3::from_shape_fn((3, 3, 2), |(c, m, f)| (c + 10 * m + 100 * f) as f64);
        let trial = MarkerTrajectory::new(["Sub01:RASI", "Sub01:extra", "Sub01:LASI"], data, 100.0).unwrap();
        let names = MarkerNames::resolve_available(trial.names()).unwrap();
        let relabeled = names.relabel(&trial).unwrap();

        // 正規順（LASI が先）に並び替わり、対応のないラベルは落ちる
        assert_eq!(relabeled.names(), &["LASI".to_string(), "RASI".to_string()]);
        assert_eq!(relabeled.position(0, 1), trial.position(2, 1));
        assert_eq!(relabeled.position(1, 0), trial.position(0, 0));
        assert_eq!(relabeled.index_of("LASI").unwrap(), 0);
    }
}
